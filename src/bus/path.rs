//! # Object Paths
//!
//! An [`ObjectPath`] is the bus-level address of an exported object. Paths are
//! validated once at construction so the rest of the crate can use them as map
//! keys without re-checking.

use super::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A validated bus object path such as `/com/example/Echo`.
///
/// Rules: the path starts with `/`, the root path is exactly `/`, and every
/// other element is a non-empty run of `[A-Za-z0-9_]`. No trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Parses and validates an object path.
    pub fn parse(path: impl Into<String>) -> Result<Self, TransportError> {
        let path = path.into();
        if is_valid(&path) {
            Ok(Self(path))
        } else {
            Err(TransportError::InvalidObjectPath(path))
        }
    }

    /// The root object path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if `self` is `other` or one of its ancestors.
    pub fn is_prefix_of(&self, other: &ObjectPath) -> bool {
        if self.0 == "/" {
            return true;
        }
        other.0 == self.0
            || (other.0.starts_with(&self.0) && other.0.as_bytes()[self.0.len()] == b'/')
    }
}

fn is_valid(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|element| {
        !element.is_empty()
            && element
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectPath {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = TransportError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ObjectPath> for String {
    fn from(path: ObjectPath) -> Self {
        path.0
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        for path in ["/", "/a", "/com/example/Echo", "/a_1/B2/c_"] {
            assert!(ObjectPath::parse(path).is_ok(), "{path} should be valid");
        }
    }

    #[test]
    fn test_invalid_paths() {
        for path in ["", "a", "//", "/a/", "/a//b", "/a-b", "/a b", "/é"] {
            assert!(
                matches!(ObjectPath::parse(path), Err(TransportError::InvalidObjectPath(_))),
                "{path:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_prefix() {
        let parent = ObjectPath::parse("/com/example").unwrap();
        let child = ObjectPath::parse("/com/example/Echo").unwrap();
        let sibling = ObjectPath::parse("/com/examples").unwrap();
        assert!(parent.is_prefix_of(&child));
        assert!(parent.is_prefix_of(&parent));
        assert!(!parent.is_prefix_of(&sibling));
        assert!(ObjectPath::root().is_prefix_of(&sibling));
        assert!(!child.is_prefix_of(&parent));
    }
}
