//! # Mailbox Messages
//!
//! Everything the bridge delivers to a process arrives as a
//! [`MailboxMessage`]. There are three shapes:
//!
//! - [`MailboxMessage::Incoming`]: a method call or signal addressed to an
//!   object the process registered (or matched by one of its subscriptions).
//! - [`MailboxMessage::Reply`]: the completion of a call the process issued,
//!   tagged with the [`CallToken`] it got back from `Bridge::call`.
//! - [`MailboxMessage::Malformed`]: a message whose arguments the codec could
//!   not represent. The process decides what to do with it (for a method
//!   call it usually replies with an error).

use super::term::Term;
use crate::bus::{BusMessage, MessageKind, ObjectPath, Serial};
use crate::codec::ConversionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlates an outgoing call with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallToken(Serial);

impl CallToken {
    pub fn new(serial: Serial) -> Self {
        Self(serial)
    }

    pub fn serial(&self) -> Serial {
        self.0
    }
}

impl fmt::Display for CallToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#Ref<{}>", self.0)
    }
}

/// Header fields of a delivered bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub serial: Option<Serial>,
    pub reply_serial: Option<Serial>,
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub no_reply_expected: bool,
}

impl From<&BusMessage> for MessageHeader {
    fn from(message: &BusMessage) -> Self {
        Self {
            kind: message.kind,
            serial: message.serial,
            reply_serial: message.reply_serial,
            sender: message.sender.clone(),
            destination: message.destination.clone(),
            path: message.path.clone(),
            interface: message.interface.clone(),
            member: message.member.clone(),
            error_name: message.error_name.clone(),
            no_reply_expected: message.no_reply_expected,
        }
    }
}

impl MessageHeader {
    pub fn expects_reply(&self) -> bool {
        self.kind == MessageKind::MethodCall && !self.no_reply_expected
    }
}

/// A method call or signal with its arguments decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub header: MessageHeader,
    pub args: Vec<Term>,
}

impl IncomingMessage {
    pub fn path(&self) -> Option<&ObjectPath> {
        self.header.path.as_ref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.header.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.header.member.as_deref()
    }

    pub fn is_method_call(&self) -> bool {
        self.header.kind == MessageKind::MethodCall
    }

    pub fn is_signal(&self) -> bool {
        self.header.kind == MessageKind::Signal
    }
}

/// How an outgoing call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// The callee returned these values.
    Return(Vec<Term>),
    /// The callee (or the bus) answered with a named error.
    Error { name: String, args: Vec<Term> },
    /// No reply arrived within the call timeout.
    Timeout,
}

/// The reply to a call issued through the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct CallReply {
    pub token: CallToken,
    /// The payload the caller attached when issuing the call.
    pub payload: Option<Term>,
    pub outcome: ReplyOutcome,
}

/// A message the codec could not convert.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedMessage {
    pub header: MessageHeader,
    /// Set when the malformed message is the reply to one of our calls.
    pub token: Option<CallToken>,
    pub payload: Option<Term>,
    pub error: ConversionError,
}

/// What the bridge puts into a process mailbox.
#[derive(Debug, Clone, PartialEq)]
pub enum MailboxMessage {
    Incoming(IncomingMessage),
    Reply(CallReply),
    Malformed(MalformedMessage),
}

impl MailboxMessage {
    /// The call token, for replies (including malformed ones).
    pub fn token(&self) -> Option<CallToken> {
        match self {
            MailboxMessage::Incoming(_) => None,
            MailboxMessage::Reply(reply) => Some(reply.token),
            MailboxMessage::Malformed(malformed) => malformed.token,
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            MailboxMessage::Incoming(message) if message.is_signal() => "signal",
            MailboxMessage::Incoming(_) => "call",
            MailboxMessage::Reply(_) => "reply",
            MailboxMessage::Malformed(_) => "malformed",
        }
    }
}
