//! # Mock Connection
//!
//! A [`Connection`] for testing the bridge without a bus.
//!
//! Nothing happens on its own: the test plays the dispatch loop. Incoming
//! messages are pushed with [`MockConnection::deliver`], replies and timeouts
//! with [`complete`](MockConnection::complete) and
//! [`time_out`](MockConnection::time_out), and callbacks the connection owes
//! (unregister notifications, replies that arrived before their handler) run
//! on [`flush`](MockConnection::flush). Callbacks are always invoked with no
//! lock held, exactly like a real dispatch loop.
//!
//! Failures are injected with a fluent expectation API:
//!
//! ```ignore
//! let connection = MockConnection::new(":1.1");
//! connection.expect(MockOp::AddObjectPathHandler).return_err(TransportError::Io("boom".into()));
//!
//! // ... exercise the bridge ...
//!
//! connection.verify(); // every queued failure was consumed
//! ```

use crate::bus::{
    BusMessage, Connection, FilterId, HandlerResult, MessageHandler, ObjectPath, PendingCall,
    ReplyHandler, Serial, TransportError, ERROR_DISCONNECTED, ERROR_NO_REPLY,
    ERROR_UNKNOWN_OBJECT,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// =============================================================================
// EXPECTATION BUILDER API
// =============================================================================

/// The connection operations a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Send,
    SendWithReply,
    SetReplyHandler,
    AddObjectPathHandler,
    RemoveObjectPathHandler,
    AddFilter,
    RemoveFilter,
}

/// Builder returned by [`MockConnection::expect`].
pub struct ExpectationBuilder {
    op: MockOp,
    state: Arc<Mutex<MockState>>,
}

impl ExpectationBuilder {
    /// The next invocation of the operation fails with `error`.
    pub fn return_err(self, error: TransportError) {
        lock(&self.state).failures.push_back((self.op, error));
    }
}

// =============================================================================
// THE MOCK
// =============================================================================

enum Deferred {
    Reply {
        pending: PendingCall,
        handler: Arc<dyn ReplyHandler>,
        reply: BusMessage,
    },
    Unregister(Arc<dyn MessageHandler>),
}

#[derive(Default)]
struct PendingSlot {
    handler: Option<Arc<dyn ReplyHandler>>,
    reply: Option<BusMessage>,
    timeout: Duration,
}

struct MockState {
    open: bool,
    next_serial: u32,
    next_filter: u64,
    objects: HashMap<ObjectPath, Arc<dyn MessageHandler>>,
    filters: Vec<(FilterId, Arc<dyn MessageHandler>)>,
    pending: HashMap<Serial, PendingSlot>,
    deferred: VecDeque<Deferred>,
    sent: Vec<BusMessage>,
    failures: VecDeque<(MockOp, TransportError)>,
}

impl MockState {
    fn injected(&mut self, op: MockOp) -> Result<(), TransportError> {
        match self.failures.iter().position(|(failing, _)| *failing == op) {
            Some(index) => match self.failures.remove(index) {
                Some((_, error)) => Err(error),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection driven step by step from a test.
pub struct MockConnection {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new(unique_name: impl Into<String>) -> Self {
        Self {
            name: unique_name.into(),
            state: Arc::new(Mutex::new(MockState {
                open: true,
                next_serial: 1,
                next_filter: 0,
                objects: HashMap::new(),
                filters: Vec::new(),
                pending: HashMap::new(),
                deferred: VecDeque::new(),
                sent: Vec::new(),
                failures: VecDeque::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    /// Queues a failure for the next call of `op`.
    pub fn expect(&self, op: MockOp) -> ExpectationBuilder {
        ExpectationBuilder {
            op,
            state: self.state.clone(),
        }
    }

    /// Panics if an injected failure was never triggered.
    pub fn verify(&self) {
        let state = self.state();
        if !state.failures.is_empty() {
            panic!(
                "Not all expectations were met. {} remaining",
                state.failures.len()
            );
        }
    }

    /// Dispatches an incoming message the way the bus would: filters first,
    /// then the handler of the message's path. An unhandled method call is
    /// answered with an unknown-object error (visible in [`sent`](Self::sent)).
    /// Replies are routed to their pending call instead.
    pub fn deliver(&self, message: BusMessage) -> HandlerResult {
        self.flush();
        if message.is_reply() {
            let delivered = self.complete_call(message);
            self.flush();
            return if delivered {
                HandlerResult::Handled
            } else {
                HandlerResult::NotYetHandled
            };
        }

        let (filters, object) = {
            let state = self.state();
            let filters: Vec<_> = state.filters.iter().map(|(_, h)| h.clone()).collect();
            let object = message
                .path
                .as_ref()
                .and_then(|path| state.objects.get(path).cloned());
            (filters, object)
        };

        let mut result = HandlerResult::NotYetHandled;
        for filter in filters {
            result = filter.handle_message(&message);
            if result == HandlerResult::Handled {
                break;
            }
        }
        if result == HandlerResult::NotYetHandled {
            if let Some(object) = object {
                result = object.handle_message(&message);
            }
        }
        if result == HandlerResult::NotYetHandled && message.expects_reply() {
            let mut reply = BusMessage::error(&message, ERROR_UNKNOWN_OBJECT, "No such object");
            reply.sender = Some(self.name.clone());
            self.state().sent.push(reply);
        }

        self.flush();
        result
    }

    /// Completes the call with serial `serial` with `reply`. Returns whether
    /// a pending call accepted it.
    pub fn complete(&self, serial: Serial, mut reply: BusMessage) -> bool {
        self.flush();
        reply.reply_serial = Some(serial);
        let delivered = self.complete_call(reply);
        self.flush();
        delivered
    }

    /// Times the call out, as if its timeout had elapsed.
    pub fn time_out(&self, serial: Serial) -> bool {
        let reply = BusMessage::error_reply(
            Some(serial),
            Some(self.name.clone()),
            ERROR_NO_REPLY,
            "Did not receive a reply before the timeout expired",
        );
        self.complete(serial, reply)
    }

    /// Runs every callback the connection owes.
    pub fn flush(&self) {
        loop {
            let next = self.state().deferred.pop_front();
            match next {
                Some(Deferred::Reply {
                    pending,
                    handler,
                    reply,
                }) => handler.handle_reply(pending, reply),
                Some(Deferred::Unregister(handler)) => handler.unregister(),
                None => break,
            }
        }
    }

    /// Every message sent through this connection so far.
    pub fn sent(&self) -> Vec<BusMessage> {
        self.state().sent.clone()
    }

    pub fn has_handler(&self, path: &ObjectPath) -> bool {
        self.state().objects.contains_key(path)
    }

    pub fn filter_count(&self) -> usize {
        self.state().filters.len()
    }

    /// Calls sent with a reply expected that have not completed yet.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// The timeout requested for the call with serial `serial`.
    pub fn timeout_of(&self, serial: Serial) -> Option<Duration> {
        self.state().pending.get(&serial).map(|slot| slot.timeout)
    }

    fn complete_call(&self, reply: BusMessage) -> bool {
        let Some(serial) = reply.reply_serial else {
            return false;
        };
        let mut state = self.state();
        let Some(slot) = state.pending.get_mut(&serial) else {
            return false;
        };
        if slot.reply.is_some() {
            return false;
        }
        if slot.handler.is_none() {
            slot.reply = Some(reply);
            return true;
        }
        let handler = state.pending.remove(&serial).and_then(|slot| slot.handler);
        drop(state);

        if let Some(handler) = handler {
            handler.handle_reply(PendingCall::new(serial), reply);
        }
        true
    }

    fn stamp(&self, state: &mut MockState, mut message: BusMessage) -> BusMessage {
        message.serial = Some(Serial::new(state.next_serial));
        message.sender = Some(self.name.clone());
        state.next_serial += 1;
        message
    }
}

impl Connection for MockConnection {
    fn unique_name(&self) -> String {
        self.name.clone()
    }

    fn send(&self, message: BusMessage) -> Result<Serial, TransportError> {
        let mut state = self.state();
        state.injected(MockOp::Send)?;
        state.check_open()?;
        let message = self.stamp(&mut state, message);
        let serial = message.serial.unwrap_or(Serial::new(0));
        state.sent.push(message);
        Ok(serial)
    }

    fn send_with_reply(
        &self,
        message: BusMessage,
        timeout: Duration,
    ) -> Result<PendingCall, TransportError> {
        let mut state = self.state();
        state.injected(MockOp::SendWithReply)?;
        state.check_open()?;
        let message = self.stamp(&mut state, message);
        let serial = message.serial.unwrap_or(Serial::new(0));
        state.pending.insert(
            serial,
            PendingSlot {
                timeout,
                ..PendingSlot::default()
            },
        );
        state.sent.push(message);
        Ok(PendingCall::new(serial))
    }

    fn set_pending_call_reply_handler(
        &self,
        pending: &PendingCall,
        handler: Arc<dyn ReplyHandler>,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.injected(MockOp::SetReplyHandler)?;
        let serial = pending.serial();
        let slot = state
            .pending
            .get_mut(&serial)
            .ok_or(TransportError::UnknownPendingCall(serial))?;
        match slot.reply.take() {
            Some(reply) => {
                state.pending.remove(&serial);
                state.deferred.push_back(Deferred::Reply {
                    pending: *pending,
                    handler,
                    reply,
                });
            }
            None => slot.handler = Some(handler),
        }
        Ok(())
    }

    fn cancel_pending_call(&self, pending: &PendingCall) {
        self.state().pending.remove(&pending.serial());
    }

    fn add_object_path_handler(
        &self,
        path: &ObjectPath,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.injected(MockOp::AddObjectPathHandler)?;
        state.check_open()?;
        if state.objects.contains_key(path) {
            return Err(TransportError::PathInUse(path.clone()));
        }
        state.objects.insert(path.clone(), handler);
        Ok(())
    }

    fn remove_object_path_handler(&self, path: &ObjectPath) -> Result<(), TransportError> {
        let mut state = self.state();
        state.injected(MockOp::RemoveObjectPathHandler)?;
        let handler = state
            .objects
            .remove(path)
            .ok_or_else(|| TransportError::NoHandler(path.clone()))?;
        state.deferred.push_back(Deferred::Unregister(handler));
        Ok(())
    }

    fn add_filter(&self, handler: Arc<dyn MessageHandler>) -> Result<FilterId, TransportError> {
        let mut state = self.state();
        state.injected(MockOp::AddFilter)?;
        state.check_open()?;
        state.next_filter += 1;
        let id = FilterId::new(state.next_filter);
        state.filters.push((id, handler));
        Ok(id)
    }

    fn remove_filter(&self, id: FilterId) -> Result<(), TransportError> {
        let mut state = self.state();
        state.injected(MockOp::RemoveFilter)?;
        let index = state
            .filters
            .iter()
            .position(|(filter, _)| *filter == id)
            .ok_or(TransportError::UnknownFilter(id))?;
        let (_, handler) = state.filters.remove(index);
        state.deferred.push_back(Deferred::Unregister(handler));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn close(&self) {
        let mut state = self.state();
        if !state.open {
            return;
        }
        state.open = false;

        let objects: Vec<_> = state.objects.drain().map(|(_, handler)| handler).collect();
        let filters: Vec<_> = state.filters.drain(..).map(|(_, handler)| handler).collect();
        for handler in objects.into_iter().chain(filters) {
            state.deferred.push_back(Deferred::Unregister(handler));
        }
        let pending: Vec<_> = state.pending.drain().collect();
        for (serial, slot) in pending {
            if let Some(handler) = slot.handler {
                let reply = BusMessage::error_reply(
                    Some(serial),
                    Some(self.name.clone()),
                    ERROR_DISCONNECTED,
                    "Connection was closed",
                );
                state.deferred.push_back(Deferred::Reply {
                    pending: PendingCall::new(serial),
                    handler,
                    reply,
                });
            }
        }
    }
}
