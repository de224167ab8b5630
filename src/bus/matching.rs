//! Match rules for connection-level filters.

use super::message::{BusMessage, MessageKind};
use super::path::ObjectPath;

/// Selects messages by header fields. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub kind: Option<MessageKind>,
    pub sender: Option<String>,
    pub path: Option<ObjectPath>,
    /// Matches the path itself and every descendant.
    pub path_namespace: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// A rule matching signals only.
    pub fn signals() -> Self {
        Self::new().with_kind(MessageKind::Signal)
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_path(mut self, path: ObjectPath) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_path_namespace(mut self, namespace: ObjectPath) -> Self {
        self.path_namespace = Some(namespace);
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn matches(&self, message: &BusMessage) -> bool {
        fn field(rule: &Option<String>, actual: &Option<String>) -> bool {
            match rule {
                Some(expected) => actual.as_deref() == Some(expected.as_str()),
                None => true,
            }
        }

        if self.kind.is_some_and(|kind| kind != message.kind) {
            return false;
        }
        if let Some(path) = &self.path {
            if message.path.as_ref() != Some(path) {
                return false;
            }
        }
        if let Some(namespace) = &self.path_namespace {
            match &message.path {
                Some(path) if namespace.is_prefix_of(path) => {}
                _ => return false,
            }
        }
        field(&self.sender, &message.sender)
            && field(&self.interface, &message.interface)
            && field(&self.member, &message.member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> ObjectPath {
        ObjectPath::parse(p).unwrap()
    }

    #[test]
    fn test_empty_rule_matches_everything() {
        let signal = BusMessage::signal(path("/a"), "com.example.I", "Changed");
        let call = BusMessage::method_call(":1.1", path("/b"), "com.example.I", "Get");
        assert!(MatchRule::new().matches(&signal));
        assert!(MatchRule::new().matches(&call));
    }

    #[test]
    fn test_rule_fields() {
        let mut signal = BusMessage::signal(path("/com/example/Sensor"), "com.example.Sensor", "Reading");
        signal.sender = Some(":1.7".to_string());

        assert!(MatchRule::signals().matches(&signal));
        assert!(MatchRule::signals()
            .with_interface("com.example.Sensor")
            .with_member("Reading")
            .with_sender(":1.7")
            .matches(&signal));
        assert!(!MatchRule::signals().with_member("Other").matches(&signal));
        assert!(!MatchRule::signals().with_sender(":1.8").matches(&signal));
        assert!(!MatchRule::new()
            .with_kind(MessageKind::MethodCall)
            .matches(&signal));
        assert!(MatchRule::new()
            .with_path_namespace(path("/com/example"))
            .matches(&signal));
        assert!(!MatchRule::new().with_path(path("/com/example")).matches(&signal));
    }
}
