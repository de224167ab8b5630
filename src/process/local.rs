//! # Local Process Runtime
//!
//! A small actor runtime: every process is identified by a [`Pid`] and owns a
//! [`Mailbox`] backed by an unbounded Tokio channel. A process is alive for as
//! long as its mailbox exists. Dropping the mailbox (the task returned, panicked
//! or was aborted) or calling [`LocalRuntime::exit`] terminates it and runs
//! its death hooks exactly once.

use super::{
    CallToken, DeathHook, MailboxMessage, Pid, ProcessRuntime, ResourceHandle, RuntimeError,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

struct ProcessSlot {
    sender: mpsc::UnboundedSender<MailboxMessage>,
    hooks: Vec<DeathHook>,
}

#[derive(Default)]
struct RuntimeInner {
    processes: Mutex<HashMap<Pid, ProcessSlot>>,
    resources: Mutex<HashMap<ResourceHandle, Pid>>,
    next_pid: AtomicU64,
    next_resource: AtomicU64,
}

impl RuntimeInner {
    fn processes(&self) -> MutexGuard<'_, HashMap<Pid, ProcessSlot>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resources(&self) -> MutexGuard<'_, HashMap<ResourceHandle, Pid>> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exit(&self, pid: Pid) -> bool {
        let Some(slot) = self.processes().remove(&pid) else {
            return false;
        };
        debug!(%pid, hooks = slot.hooks.len(), "Process exited");
        // Hooks may call back into the runtime, so the table lock is released first.
        for hook in slot.hooks {
            hook(pid);
        }
        true
    }
}

/// A Tokio-backed process runtime.
///
/// Cloning yields another handle to the same runtime.
#[derive(Clone, Default)]
pub struct LocalRuntime {
    inner: Arc<RuntimeInner>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a process whose mailbox is held by the caller. The process
    /// lives until the mailbox is dropped.
    pub fn spawn_process(&self) -> Mailbox {
        let pid = Pid::from_raw(self.inner.next_pid.fetch_add(1, Ordering::SeqCst) + 1);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.processes().insert(
            pid,
            ProcessSlot {
                sender,
                hooks: Vec::new(),
            },
        );
        debug!(%pid, "Process spawned");
        Mailbox {
            pid,
            receiver,
            saved: VecDeque::new(),
            runtime: Arc::downgrade(&self.inner),
        }
    }

    /// Spawns a process running `body` on its own Tokio task. The process
    /// terminates when `body` completes, panics or the task is aborted.
    pub fn spawn<F, Fut>(&self, body: F) -> (Pid, JoinHandle<()>)
    where
        F: FnOnce(Mailbox) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mailbox = self.spawn_process();
        let pid = mailbox.pid();
        let handle = tokio::spawn(body(mailbox));
        (pid, handle)
    }

    /// Terminates `pid`. Returns `false` if it was not alive.
    pub fn exit(&self, pid: Pid) -> bool {
        self.inner.exit(pid)
    }

    pub fn process_count(&self) -> usize {
        self.inner.processes().len()
    }

    /// Number of resources created and not yet released.
    pub fn live_resources(&self) -> usize {
        self.inner.resources().len()
    }

    /// Resources currently owned by `pid`.
    pub fn resources_owned_by(&self, pid: Pid) -> usize {
        self.inner
            .resources()
            .values()
            .filter(|owner| **owner == pid)
            .count()
    }
}

impl ProcessRuntime for LocalRuntime {
    fn mailbox_send(&self, pid: Pid, message: MailboxMessage) -> Result<(), RuntimeError> {
        let processes = self.inner.processes();
        let slot = processes
            .get(&pid)
            .ok_or(RuntimeError::ProcessNotFound(pid))?;
        trace!(%pid, kind = message.label(), "Mailbox send");
        slot.sender
            .send(message)
            .map_err(|_| RuntimeError::ProcessNotFound(pid))
    }

    fn is_alive(&self, pid: Pid) -> bool {
        self.inner.processes().contains_key(&pid)
    }

    fn notify_on_death(&self, pid: Pid, hook: DeathHook) -> Result<(), RuntimeError> {
        let mut processes = self.inner.processes();
        let slot = processes
            .get_mut(&pid)
            .ok_or(RuntimeError::ProcessNotFound(pid))?;
        slot.hooks.push(hook);
        Ok(())
    }

    fn create_resource(&self, owner: Pid) -> ResourceHandle {
        let handle =
            ResourceHandle::from_raw(self.inner.next_resource.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner.resources().insert(handle, owner);
        trace!(%owner, %handle, "Resource created");
        handle
    }

    fn release_resource(&self, handle: ResourceHandle) {
        if self.inner.resources().remove(&handle).is_some() {
            trace!(%handle, "Resource released");
        }
    }
}

/// The receiving side of a process. Owning it is what keeps the process alive.
pub struct Mailbox {
    pid: Pid,
    receiver: mpsc::UnboundedReceiver<MailboxMessage>,
    /// Messages skipped over by a selective receive, in arrival order.
    saved: VecDeque<MailboxMessage>,
    runtime: Weak<RuntimeInner>,
}

impl Mailbox {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Receives the next message. Returns `None` once the process has been
    /// terminated and the mailbox is drained.
    pub async fn recv(&mut self) -> Option<MailboxMessage> {
        if let Some(message) = self.saved.pop_front() {
            return Some(message);
        }
        self.receiver.recv().await
    }

    /// Like [`recv`](Self::recv) but gives up after `duration`.
    pub async fn recv_timeout(&mut self, duration: Duration) -> Option<MailboxMessage> {
        tokio::time::timeout(duration, self.recv())
            .await
            .ok()
            .flatten()
    }

    /// Returns a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<MailboxMessage> {
        self.saved
            .pop_front()
            .or_else(|| self.receiver.try_recv().ok())
    }

    /// Waits for the reply (or malformed reply) carrying `token`. Other
    /// messages are kept and returned by later receives in their original
    /// order.
    pub async fn recv_reply(&mut self, token: CallToken) -> Option<MailboxMessage> {
        if let Some(index) = self
            .saved
            .iter()
            .position(|message| message.token() == Some(token))
        {
            return self.saved.remove(index);
        }
        while let Some(message) = self.receiver.recv().await {
            if message.token() == Some(token) {
                return Some(message);
            }
            self.saved.push_back(message);
        }
        None
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.exit(self.pid);
        }
    }
}
