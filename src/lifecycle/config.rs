//! Bridge configuration.

use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Tunables for a [`Bridge`](crate::bridge::Bridge).
///
/// Deserializable so it can be embedded in an application's own config file.
/// Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Reply timeout for outgoing calls that do not set their own.
    pub call_timeout_ms: u64,
    /// Container nesting limit for the default codec.
    pub max_nesting_depth: usize,
}

impl BridgeConfig {
    pub const ENV_CALL_TIMEOUT: &'static str = "EBUS_CALL_TIMEOUT_MS";
    pub const ENV_MAX_NESTING_DEPTH: &'static str = "EBUS_MAX_NESTING_DEPTH";

    /// Defaults overlaid with `EBUS_CALL_TIMEOUT_MS` and
    /// `EBUS_MAX_NESTING_DEPTH`. Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(Self::ENV_CALL_TIMEOUT) {
            match raw.parse() {
                Ok(ms) => self.call_timeout_ms = ms,
                Err(_) => warn!(key = Self::ENV_CALL_TIMEOUT, value = %raw, "Ignoring invalid value"),
            }
        }
        if let Some(raw) = lookup(Self::ENV_MAX_NESTING_DEPTH) {
            match raw.parse() {
                Ok(depth) => self.max_nesting_depth = depth,
                Err(_) => warn!(key = Self::ENV_MAX_NESTING_DEPTH, value = %raw, "Ignoring invalid value"),
            }
        }
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 25_000,
            max_nesting_depth: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_overlay_from_environment() {
        let env: HashMap<&str, &str> = [
            (BridgeConfig::ENV_CALL_TIMEOUT, "1500"),
            (BridgeConfig::ENV_MAX_NESTING_DEPTH, "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = BridgeConfig::default().overlay(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.call_timeout(), Duration::from_millis(1500));
        assert_eq!(config.max_nesting_depth, 64);
    }
}
