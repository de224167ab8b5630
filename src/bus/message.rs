//! # Bus Messages
//!
//! [`BusMessage`] models the four bus message kinds (method call, method
//! return, error, signal). Serial numbers are assigned by the connection when
//! a message is sent; replies point back at the call through `reply_serial`.

use super::path::ObjectPath;
use super::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-connection message serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Serial(u32);

impl Serial {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::MethodCall => "method_call",
            MessageKind::MethodReturn => "method_return",
            MessageKind::Error => "error",
            MessageKind::Signal => "signal",
        };
        f.write_str(name)
    }
}

/// A message as seen by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub kind: MessageKind,
    /// Assigned by the sending connection.
    pub serial: Option<Serial>,
    /// Serial of the call this message answers (returns and errors only).
    pub reply_serial: Option<Serial>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub destination: Option<String>,
    /// Unique name of the sending connection, stamped on send.
    pub sender: Option<String>,
    pub no_reply_expected: bool,
    pub body: Vec<Value>,
}

impl BusMessage {
    fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: None,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            no_reply_expected: false,
            body: Vec::new(),
        }
    }

    /// A method call addressed to `destination` at `path`.
    pub fn method_call(
        destination: impl Into<String>,
        path: ObjectPath,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            destination: Some(destination.into()),
            path: Some(path),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::empty(MessageKind::MethodCall)
        }
    }

    /// A broadcast signal emitted from `path`.
    pub fn signal(path: ObjectPath, interface: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            path: Some(path),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::empty(MessageKind::Signal)
        }
    }

    /// A successful reply to `call`.
    pub fn method_return(call: &BusMessage) -> Self {
        Self::return_reply(call.serial, call.sender.clone())
    }

    /// A successful reply built from a reply serial and destination directly.
    pub fn return_reply(reply_serial: Option<Serial>, destination: Option<String>) -> Self {
        Self {
            reply_serial,
            destination,
            ..Self::empty(MessageKind::MethodReturn)
        }
    }

    /// An error reply to `call`. `text` becomes the single string argument.
    pub fn error(call: &BusMessage, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::error_reply(call.serial, call.sender.clone(), name, text)
    }

    /// An error reply built from a reply serial and destination directly. Used
    /// by transports that synthesize errors (timeouts, disconnects).
    pub fn error_reply(
        reply_serial: Option<Serial>,
        destination: Option<String>,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            reply_serial,
            destination,
            error_name: Some(name.into()),
            body: vec![Value::String(text.into())],
            ..Self::empty(MessageKind::Error)
        }
    }

    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.body.push(arg.into());
        self
    }

    pub fn with_no_reply_expected(mut self, no_reply_expected: bool) -> Self {
        self.no_reply_expected = no_reply_expected;
        self
    }

    pub fn is_method_call(&self) -> bool {
        self.kind == MessageKind::MethodCall
    }

    pub fn is_signal(&self) -> bool {
        self.kind == MessageKind::Signal
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageKind::MethodReturn | MessageKind::Error)
    }

    /// Whether the sender waits for a reply to this message.
    pub fn expects_reply(&self) -> bool {
        self.is_method_call() && !self.no_reply_expected
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(serial) = self.serial {
            write!(f, " serial={serial}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " path={path}")?;
        }
        if let (Some(interface), Some(member)) = (&self.interface, &self.member) {
            write!(f, " {interface}.{member}")?;
        }
        if let Some(name) = &self.error_name {
            write!(f, " error={name}")?;
        }
        Ok(())
    }
}
