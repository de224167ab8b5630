//! # Host Runtime Boundary
//!
//! The bridge talks to the actor runtime through [`ProcessRuntime`] only:
//! send to a mailbox, ask whether a process is alive, get told when it dies,
//! and register resources so their lifetime is visible to the runtime.
//!
//! [`local::LocalRuntime`] implements it on top of Tokio tasks and unbounded
//! channels.

pub mod local;
pub mod message;
pub mod term;

pub use local::{LocalRuntime, Mailbox};
pub use message::{
    CallReply, CallToken, IncomingMessage, MailboxMessage, MalformedMessage, MessageHeader,
    ReplyOutcome,
};
pub use term::Term;

use serde::{Deserialize, Serialize};
use std::fmt;

/// A process identity. Copyable and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(u64);

impl Pid {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<0.{}.0>", self.0)
    }
}

/// A resource registered with the runtime on behalf of an owner process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(u64);

impl ResourceHandle {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#Resource<{}>", self.0)
    }
}

/// Errors reported by the host runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("Process not found: {0}")]
    ProcessNotFound(Pid),
}

/// Hook run once when a watched process terminates.
pub type DeathHook = Box<dyn FnOnce(Pid) + Send + 'static>;

/// The capabilities the bridge needs from the actor runtime.
///
/// None of these methods may block on another process: mailbox sends are
/// fire-and-forget.
pub trait ProcessRuntime: Send + Sync {
    /// Enqueues `message` in the mailbox of `pid`.
    fn mailbox_send(&self, pid: Pid, message: MailboxMessage) -> Result<(), RuntimeError>;

    fn is_alive(&self, pid: Pid) -> bool;

    /// Runs `hook` when `pid` terminates. Fails if `pid` is already gone, in
    /// which case `hook` is dropped without running.
    fn notify_on_death(&self, pid: Pid, hook: DeathHook) -> Result<(), RuntimeError>;

    /// Registers a resource owned by `owner`.
    fn create_resource(&self, owner: Pid) -> ResourceHandle;

    /// Releases a resource. Releasing an unknown handle is a no-op.
    fn release_resource(&self, handle: ResourceHandle);
}
