//! # Bridge Errors
//!
//! Errors returned synchronously to the process that asked for something
//! (registration, unregistration, lookup, issuing a call). Problems found while
//! dispatching on the bus side never come back through here: a dead owner is
//! dropped silently and a conversion failure is delivered to the owner as a
//! [`MailboxMessage::Malformed`](crate::process::MailboxMessage::Malformed).

use crate::bus::{ObjectPath, TransportError};
use crate::codec::ConversionError;
use crate::process::Pid;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// The path already has a live registration. Nothing was changed.
    #[error("Object path already registered: {0}")]
    RegistrationConflict(ObjectPath),

    #[error("Object path not registered: {0}")]
    UnknownPath(ObjectPath),

    /// The process the operation was issued for has terminated.
    #[error("Owning process is not alive: {0}")]
    DeadOwner(Pid),

    /// The bridge or its connection has begun shutdown.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for BridgeError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => BridgeError::ConnectionClosed,
            TransportError::PathInUse(path) => BridgeError::RegistrationConflict(path),
            TransportError::NoHandler(path) => BridgeError::UnknownPath(path),
            other => BridgeError::Transport(other),
        }
    }
}
