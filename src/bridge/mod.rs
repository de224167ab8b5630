//! # The Object/Connection Bridge
//!
//! [`Bridge`] couples one bus [`Connection`] to a [`ProcessRuntime`]. Processes
//! use it to:
//!
//! - register object paths ([`Bridge::register`]); calls and signals sent to a
//!   path arrive in the owner's mailbox as
//!   [`MailboxMessage::Incoming`](crate::process::MailboxMessage::Incoming),
//! - issue calls without blocking ([`Bridge::call`]); the reply arrives later
//!   as a [`MailboxMessage::Reply`](crate::process::MailboxMessage::Reply)
//!   carrying the returned [`CallToken`],
//! - answer calls, emit signals and subscribe to signals by match rule.
//!
//! ## Ownership
//!
//! Every registration is a [`BridgeResource`] owned by exactly one process.
//! The resource holds the bus-side registrations made for it and gives them
//! back when it is released. Release happens in one place only, the unregister
//! callback of its object path handler, which the connection runs after the
//! handler is removed for any reason: explicit [`unregister`](Bridge::unregister),
//! owner death, or [`close`](Bridge::close).
//!
//! The first registration or call made for a process installs a death hook
//! with the runtime. When the process dies its paths are unregistered and its
//! outstanding calls are cancelled, so nothing is ever delivered to a dead
//! mailbox and nothing leaks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ebus_bridge::bridge::Bridge;
//! use ebus_bridge::bus::{MemoryBus, ObjectPath};
//! use ebus_bridge::lifecycle::BridgeConfig;
//! use ebus_bridge::process::LocalRuntime;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = MemoryBus::new();
//! let runtime = LocalRuntime::new();
//! let bridge: Bridge = Bridge::new(bus.connect(), Arc::new(runtime.clone()), BridgeConfig::default());
//!
//! let mut mailbox = runtime.spawn_process();
//! bridge.register(ObjectPath::parse("/svc")?, mailbox.pid(), ())?;
//! while let Some(message) = mailbox.recv().await {
//!     println!("{}", message.label());
//! }
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod pending;
mod registry;
mod resource;

pub use pending::PendingCallContext;
pub use resource::BridgeResource;

use crate::bus::{BusMessage, Connection, FilterId, MatchRule, ObjectPath, Serial, TransportError};
use crate::codec::{Codec, TermCodec};
use crate::error::BridgeError;
use crate::lifecycle::BridgeConfig;
use crate::process::{CallToken, DeathHook, MessageHeader, Pid, ProcessRuntime, RuntimeError, Term};
use dispatch::{CallbackGuard, ObjectBinding, ReplyBinding, SubscriptionBinding};
use pending::PendingCalls;
use registry::ObjectRegistry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// An outgoing method call, built fluently and handed to [`Bridge::call`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingCall {
    destination: String,
    path: ObjectPath,
    interface: String,
    member: String,
    args: Vec<Term>,
    timeout: Option<Duration>,
    payload: Option<Term>,
}

impl OutgoingCall {
    pub fn new(
        destination: impl Into<String>,
        path: ObjectPath,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            path,
            interface: interface.into(),
            member: member.into(),
            args: Vec::new(),
            timeout: None,
            payload: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Term>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<Term>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Overrides [`BridgeConfig::call_timeout_ms`] for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// A value handed back untouched with the reply.
    pub fn with_payload(mut self, payload: impl Into<Term>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

pub(crate) struct BridgeCore<P> {
    connection: Arc<dyn Connection>,
    runtime: Arc<dyn ProcessRuntime>,
    codec: Arc<dyn Codec>,
    config: BridgeConfig,
    registry: Mutex<ObjectRegistry<P>>,
    pending: Mutex<PendingCalls>,
    /// Processes that already have our death hook installed.
    watched: Mutex<HashSet<Pid>>,
    guard: CallbackGuard,
    closed: AtomicBool,
}

impl<P> BridgeCore<P> {
    fn registry(&self) -> MutexGuard<'_, ObjectRegistry<P>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watched(&self) -> MutexGuard<'_, HashSet<Pid>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.connection.is_open()
    }

    fn check_open(&self) -> Result<(), BridgeError> {
        if self.is_closed() {
            Err(BridgeError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Takes the object path handler of `resource` off the connection. The
    /// connection then runs its unregister callback, which releases the
    /// resource. If the handler is already gone the resource is released
    /// here. Any other failure leaves both the handler and the resource live.
    fn remove_handler(&self, resource: &BridgeResource<P>) -> Result<(), TransportError> {
        match self.connection.remove_object_path_handler(resource.path()) {
            Ok(()) => Ok(()),
            Err(TransportError::NoHandler(_)) => {
                debug!(path = %resource.path(), "Handler already removed");
                resource.release();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Puts back a resource whose handler is still on the connection, so the
    /// next delivery to it retries the eviction.
    fn relist(&self, resource: &Arc<BridgeResource<P>>, error: &TransportError) {
        warn!(path = %resource.path(), owner = %resource.owner(), %error, "Handler removal failed, registration kept");
        let _ = self.registry().insert(resource.clone());
    }

    /// Unlists `resource` if it is still the live registration for its path
    /// and removes its handler.
    fn evict(&self, resource: &Arc<BridgeResource<P>>) {
        let removed = self.registry().remove_if_same(resource);
        if removed {
            if let Err(e) = self.remove_handler(resource) {
                self.relist(resource, &e);
            }
        }
    }

    fn owner_died(&self, pid: Pid) {
        self.watched().remove(&pid);
        let resources = self.registry().remove_owner(pid);
        for resource in &resources {
            if let Err(e) = self.remove_handler(resource) {
                self.relist(resource, &e);
            }
        }
        let abandoned = self.pending().remove_caller(pid);
        for context in &abandoned {
            self.connection.cancel_pending_call(&context.pending);
        }
        if !resources.is_empty() || !abandoned.is_empty() {
            info!(owner = %pid, paths = resources.len(), calls = abandoned.len(), "Owner terminated");
        }
    }
}

impl<P: Send + Sync + 'static> BridgeCore<P> {
    /// Makes sure `pid` has a death hook pointing at this bridge.
    fn watch(self: &Arc<Self>, pid: Pid) -> Result<(), RuntimeError> {
        if !self.watched().insert(pid) {
            return Ok(());
        }
        let core = Arc::downgrade(self);
        let hook: DeathHook = Box::new(move |pid| {
            if let Some(core) = core.upgrade() {
                core.owner_died(pid);
            }
        });
        if let Err(e) = self.runtime.notify_on_death(pid, hook) {
            self.watched().remove(&pid);
            return Err(e);
        }
        debug!(%pid, "Watching process");
        Ok(())
    }
}

impl<P> Drop for BridgeCore<P> {
    fn drop(&mut self) {
        let resources = self
            .registry
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        for resource in &resources {
            // A handler left behind keeps its resource and releases it once
            // the connection drops the handler.
            if let Err(e) = self.remove_handler(resource) {
                warn!(path = %resource.path(), error = %e, "Handler removal failed on drop");
            }
        }
        let abandoned = self
            .pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        for context in &abandoned {
            self.connection.cancel_pending_call(&context.pending);
        }
    }
}

/// The bridge between one bus connection and the process runtime.
///
/// `P` is the payload stored with each registration; the bridge never looks
/// at it. Cloning yields another handle to the same bridge.
pub struct Bridge<P = ()> {
    core: Arc<BridgeCore<P>>,
}

impl<P> Clone for Bridge<P> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<P: Send + Sync + 'static> Bridge<P> {
    /// Creates a bridge using the default [`TermCodec`] limited to
    /// `config.max_nesting_depth`.
    pub fn new(
        connection: Arc<dyn Connection>,
        runtime: Arc<dyn ProcessRuntime>,
        config: BridgeConfig,
    ) -> Self {
        let codec = Arc::new(TermCodec::new(config.max_nesting_depth));
        Self::with_codec(connection, runtime, config, codec)
    }

    pub fn with_codec(
        connection: Arc<dyn Connection>,
        runtime: Arc<dyn ProcessRuntime>,
        config: BridgeConfig,
        codec: Arc<dyn Codec>,
    ) -> Self {
        info!(connection = %connection.unique_name(), "Bridge created");
        Self {
            core: Arc::new(BridgeCore {
                connection,
                runtime,
                codec,
                config,
                registry: Mutex::new(ObjectRegistry::new()),
                pending: Mutex::new(PendingCalls::new()),
                watched: Mutex::new(HashSet::new()),
                guard: CallbackGuard::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Registers `path` for `owner`. Incoming messages for the path are
    /// delivered to the owner's mailbox from now on.
    ///
    /// Fails with [`BridgeError::RegistrationConflict`] if the path is taken,
    /// leaving the existing registration untouched.
    pub fn register(
        &self,
        path: ObjectPath,
        owner: Pid,
        payload: P,
    ) -> Result<Arc<BridgeResource<P>>, BridgeError> {
        let core = &self.core;
        core.check_open()?;
        if !core.runtime.is_alive(owner) {
            return Err(BridgeError::DeadOwner(owner));
        }

        let resource = {
            let mut registry = core.registry();
            if registry.contains(&path) {
                debug!(%path, %owner, "Path already registered");
                return Err(BridgeError::RegistrationConflict(path));
            }
            let resource = Arc::new(BridgeResource::new(
                path.clone(),
                owner,
                payload,
                Arc::downgrade(&core.connection),
                core.runtime.clone(),
            ));
            registry.insert(resource.clone())?;

            let binding = Arc::new(ObjectBinding::new(Arc::downgrade(core), resource.clone()));
            if let Err(e) = core.connection.add_object_path_handler(&path, binding) {
                registry.remove(&path);
                resource.release();
                return Err(e.into());
            }
            resource
        };

        // The owner may have died since the first check; its hook would then
        // have run before this entry existed.
        if core.watch(owner).is_err() || !core.runtime.is_alive(owner) {
            core.evict(&resource);
            return Err(BridgeError::DeadOwner(owner));
        }

        info!(%path, %owner, handle = %resource.handle(), "Registered");
        Ok(resource)
    }

    /// Removes the registration for `path`. The resource is released by the
    /// unregister callback once the connection has dropped its handler. If
    /// the handler cannot be removed the registration stays in place.
    pub fn unregister(&self, path: &ObjectPath) -> Result<(), BridgeError> {
        let core = &self.core;
        core.check_open()?;
        let resource = self.lookup(path)?;
        core.remove_handler(&resource)?;
        core.registry().remove_if_same(&resource);
        info!(%path, owner = %resource.owner(), "Unregistered");
        Ok(())
    }

    pub fn lookup(&self, path: &ObjectPath) -> Result<Arc<BridgeResource<P>>, BridgeError> {
        self.core
            .registry()
            .get(path)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownPath(path.clone()))
    }

    /// Issues a method call on behalf of `caller` and returns at once.
    ///
    /// The reply, an error or a timeout is delivered to `caller` later as a
    /// [`MailboxMessage::Reply`](crate::process::MailboxMessage::Reply)
    /// carrying the returned token. Arguments that
    /// cannot be encoded fail here, before anything is sent.
    pub fn call(&self, caller: Pid, call: OutgoingCall) -> Result<CallToken, BridgeError> {
        let core = &self.core;
        core.check_open()?;
        if !core.runtime.is_alive(caller) {
            return Err(BridgeError::DeadOwner(caller));
        }
        let body = core.codec.encode_args(&call.args)?;
        core.watch(caller)
            .map_err(|_| BridgeError::DeadOwner(caller))?;

        let timeout = call.timeout.unwrap_or_else(|| core.config.call_timeout());
        let message =
            BusMessage::method_call(call.destination, call.path, call.interface, call.member)
                .with_body(body);
        let pending = core.connection.send_with_reply(message, timeout)?;
        let token = CallToken::new(pending.serial());

        core.pending().insert(PendingCallContext {
            caller,
            token,
            payload: call.payload,
            pending,
        });
        let binding = Arc::new(ReplyBinding::new(Arc::downgrade(core), token));
        if let Err(e) = core.connection.set_pending_call_reply_handler(&pending, binding) {
            core.pending().take(token);
            core.connection.cancel_pending_call(&pending);
            return Err(e.into());
        }

        if !core.runtime.is_alive(caller) {
            if core.pending().take(token).is_some() {
                core.connection.cancel_pending_call(&pending);
            }
            return Err(BridgeError::DeadOwner(caller));
        }

        debug!(%token, %caller, timeout_ms = timeout.as_millis() as u64, "Call issued");
        Ok(token)
    }

    /// Sends a method return for the call described by `header`.
    pub fn reply(&self, header: &MessageHeader, args: &[Term]) -> Result<Serial, BridgeError> {
        let core = &self.core;
        core.check_open()?;
        let body = core.codec.encode_args(args)?;
        let message = BusMessage::return_reply(header.serial, header.sender.clone()).with_body(body);
        Ok(core.connection.send(message)?)
    }

    /// Sends an error reply for the call described by `header`.
    pub fn reply_error(
        &self,
        header: &MessageHeader,
        name: &str,
        text: &str,
    ) -> Result<Serial, BridgeError> {
        self.core.check_open()?;
        let message = BusMessage::error_reply(header.serial, header.sender.clone(), name, text);
        Ok(self.core.connection.send(message)?)
    }

    pub fn emit_signal(
        &self,
        path: ObjectPath,
        interface: &str,
        member: &str,
        args: &[Term],
    ) -> Result<Serial, BridgeError> {
        let core = &self.core;
        core.check_open()?;
        let body = core.codec.encode_args(args)?;
        let message = BusMessage::signal(path, interface, member).with_body(body);
        Ok(core.connection.send(message)?)
    }

    /// Sends a prebuilt message as is.
    pub fn send(&self, message: BusMessage) -> Result<Serial, BridgeError> {
        self.core.check_open()?;
        Ok(self.core.connection.send(message)?)
    }

    /// Delivers every message matching `rule` to the owner of `path`. The
    /// subscription lives as long as the registration.
    pub fn subscribe(&self, path: &ObjectPath, rule: MatchRule) -> Result<FilterId, BridgeError> {
        let core = &self.core;
        core.check_open()?;
        let resource = self.lookup(path)?;
        let binding = Arc::new(SubscriptionBinding::new(
            Arc::downgrade(core),
            resource.clone(),
            rule,
        ));
        let id = core.connection.add_filter(binding)?;
        if !resource.add_subscription(id) {
            let _ = core.connection.remove_filter(id);
            return Err(BridgeError::UnknownPath(path.clone()));
        }
        debug!(%path, %id, "Subscribed");
        Ok(id)
    }

    pub fn unsubscribe(&self, path: &ObjectPath, id: FilterId) -> Result<(), BridgeError> {
        self.core.check_open()?;
        let resource = self.lookup(path)?;
        if !resource.subscriptions_installed().contains(&id) {
            return Err(TransportError::UnknownFilter(id).into());
        }
        self.core.connection.remove_filter(id)?;
        resource.remove_subscription(id);
        debug!(%path, %id, "Unsubscribed");
        Ok(())
    }

    /// Shuts the bridge down and closes its connection. Later operations
    /// fail with [`BridgeError::ConnectionClosed`]. Outstanding calls are
    /// completed by the connection with a disconnect error. Idempotent.
    pub fn close(&self) {
        let core = &self.core;
        if core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let resources = core.registry().drain();
        for resource in &resources {
            // Closing the connection drops any handler left behind.
            if let Err(e) = core.remove_handler(resource) {
                warn!(path = %resource.path(), error = %e, "Handler removal failed on close");
            }
        }
        core.connection.close();
        info!(paths = resources.len(), pending = core.pending().len(), "Bridge closed");
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// The unique bus name replies and calls should be addressed to.
    pub fn unique_name(&self) -> String {
        self.core.connection.unique_name()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.core.config
    }

    /// Registered paths in sorted order.
    pub fn registered_paths(&self) -> Vec<ObjectPath> {
        self.core.registry().paths()
    }

    /// Number of outgoing calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.core.pending().len()
    }
}
