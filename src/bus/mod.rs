//! # Bus Transport Boundary
//!
//! This module defines what the bridge needs from a bus connection and
//! nothing more. Socket I/O, authentication and the wire encoding belong to
//! the transport; the bridge only sees [`BusMessage`]s and the callbacks it
//! registers through the [`Connection`] trait.
//!
//! ## Callback model
//!
//! A connection owns a single dispatch loop. Every callback the bridge
//! installs ([`MessageHandler`] for object paths and filters, [`ReplyHandler`]
//! for pending calls) is invoked from that loop, one at a time and never from
//! inside a `Connection` method. This lets the registration methods be called
//! from any task while the callbacks themselves stay single-threaded.
//!
//! Implementations in this crate:
//! - [`memory::MemoryBus`]: an in-process bus with a real dispatch task per
//!   connection.
//! - [`crate::mock::MockConnection`]: a connection driven step by step from
//!   tests.

pub mod matching;
pub mod memory;
pub mod message;
pub mod path;
pub mod value;

pub use matching::MatchRule;
pub use memory::{MemoryBus, MemoryConnection};
pub use message::{BusMessage, MessageKind, Serial};
pub use path::ObjectPath;
pub use value::Value;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Error name synthesized when a call times out.
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
/// Error name returned for method calls to a path nobody handles.
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
/// Error name used to fail outstanding calls when a connection closes.
pub const ERROR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
/// Generic failure.
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

/// Errors reported by a bus connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Object path already has a handler: {0}")]
    PathInUse(ObjectPath),
    #[error("No handler for object path: {0}")]
    NoHandler(ObjectPath),
    #[error("Invalid object path: {0:?}")]
    InvalidObjectPath(String),
    #[error("Unknown pending call: {0}")]
    UnknownPendingCall(Serial),
    #[error("Unknown filter: {0}")]
    UnknownFilter(FilterId),
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),
    #[error("Transport failure: {0}")]
    Io(String),
}

/// What a [`MessageHandler`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// The message was consumed; stop offering it to other handlers.
    Handled,
    /// Let the next handler (if any) see the message.
    NotYetHandled,
}

/// Callback installed for an object path or as a connection filter.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: &BusMessage) -> HandlerResult;

    /// Called once when the handler is removed from the connection, whether
    /// explicitly or because the connection is closing.
    fn unregister(&self) {}
}

/// Callback notified when an outgoing call completes.
///
/// `reply` is a method return or an error; timeouts and disconnects arrive as
/// synthesized errors ([`ERROR_NO_REPLY`], [`ERROR_DISCONNECTED`]).
pub trait ReplyHandler: Send + Sync {
    fn handle_reply(&self, pending: PendingCall, reply: BusMessage);
}

/// Handle to an outstanding outgoing call. The serial of the call message is
/// the correlation token linking it to its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingCall {
    serial: Serial,
}

impl PendingCall {
    pub fn new(serial: Serial) -> Self {
        Self { serial }
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }
}

/// Identifies a filter installed with [`Connection::add_filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(u64);

impl FilterId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter#{}", self.0)
    }
}

/// One open bus connection, as consumed by the bridge.
pub trait Connection: Send + Sync {
    /// The unique bus name of this connection (e.g. `:1.4`).
    fn unique_name(&self) -> String;

    /// Sends a message without waiting for anything. Returns the serial
    /// assigned to it.
    fn send(&self, message: BusMessage) -> Result<Serial, TransportError>;

    /// Sends a method call and tracks its reply. If nothing arrives within
    /// `timeout` the connection completes the call with an
    /// [`ERROR_NO_REPLY`] error.
    fn send_with_reply(
        &self,
        message: BusMessage,
        timeout: Duration,
    ) -> Result<PendingCall, TransportError>;

    /// Installs the callback for a pending call. A reply that already arrived
    /// is handed over on the next dispatch.
    fn set_pending_call_reply_handler(
        &self,
        pending: &PendingCall,
        handler: Arc<dyn ReplyHandler>,
    ) -> Result<(), TransportError>;

    /// Stops tracking a pending call. A later reply is discarded.
    fn cancel_pending_call(&self, pending: &PendingCall);

    /// Fails with [`TransportError::PathInUse`] if the path already has one.
    fn add_object_path_handler(
        &self,
        path: &ObjectPath,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError>;

    /// Removes the handler; its `unregister` callback runs on the next
    /// dispatch.
    fn remove_object_path_handler(&self, path: &ObjectPath) -> Result<(), TransportError>;

    fn add_filter(&self, handler: Arc<dyn MessageHandler>) -> Result<FilterId, TransportError>;

    fn remove_filter(&self, id: FilterId) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Closes the connection. Every object path handler is unregistered and
    /// every outstanding call fails with [`ERROR_DISCONNECTED`].
    fn close(&self);
}
