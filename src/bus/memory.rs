//! # In-Process Bus
//!
//! [`MemoryBus`] routes [`BusMessage`]s between [`MemoryConnection`]s living in
//! the same OS process. Each connection runs its own dispatch task: incoming
//! messages, reply completions, timeouts and unregister notifications are all
//! queued on one unbounded channel and handled strictly in order, so callbacks
//! on a connection never overlap.
//!
//! Routing follows the usual bus rules: method calls and replies go to the
//! connection named in `destination`, signals are broadcast to every
//! connection, and a method call nobody handles is answered with
//! [`ERROR_UNKNOWN_OBJECT`].
//!
//! Connections must be created from within a Tokio runtime.

use super::{
    BusMessage, Connection, FilterId, HandlerResult, MessageHandler, ObjectPath, PendingCall,
    ReplyHandler, Serial, TransportError, ERROR_DISCONNECTED, ERROR_NO_REPLY,
    ERROR_UNKNOWN_OBJECT,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Work item for a connection's dispatch task.
enum Event {
    Incoming(BusMessage),
    Timeout(Serial),
    Reply {
        pending: PendingCall,
        handler: Arc<dyn ReplyHandler>,
        reply: BusMessage,
    },
    Unregister(Arc<dyn MessageHandler>),
    Shutdown,
}

#[derive(Default)]
struct BusInner {
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn peers(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Event>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, message: BusMessage) -> Result<(), TransportError> {
        let peers = self.peers();
        if message.is_signal() {
            for events in peers.values() {
                let _ = events.send(Event::Incoming(message.clone()));
            }
            return Ok(());
        }
        let destination = message.destination.clone().unwrap_or_default();
        match peers.get(&destination) {
            Some(events) => events
                .send(Event::Incoming(message))
                .map_err(|_| TransportError::UnknownDestination(destination)),
            // A reply to a connection that went away is not the sender's problem.
            None if message.is_reply() => Ok(()),
            None => Err(TransportError::UnknownDestination(destination)),
        }
    }
}

/// An in-process message bus.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection with a fresh unique name and starts its
    /// dispatch task.
    pub fn connect(&self) -> Arc<MemoryConnection> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!(":1.{id}");
        let (events, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ConnectionState::default()));

        self.inner.peers().insert(name.clone(), events.clone());
        let dispatcher = Dispatcher {
            name: name.clone(),
            state: state.clone(),
            bus: Arc::downgrade(&self.inner),
        };
        tokio::spawn(dispatcher.run(receiver));
        info!(connection = %name, "Connection opened");

        Arc::new(MemoryConnection {
            name,
            state,
            events,
            bus: Arc::downgrade(&self.inner),
            next_serial: AtomicU32::new(1),
            open: AtomicBool::new(true),
        })
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.peers().len()
    }
}

struct PendingSlot {
    handler: Option<Arc<dyn ReplyHandler>>,
    reply: Option<BusMessage>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ConnectionState {
    objects: HashMap<ObjectPath, Arc<dyn MessageHandler>>,
    filters: Vec<(FilterId, Arc<dyn MessageHandler>)>,
    next_filter: u64,
    pending: HashMap<Serial, PendingSlot>,
}

/// One connection to a [`MemoryBus`].
pub struct MemoryConnection {
    name: String,
    state: Arc<Mutex<ConnectionState>>,
    events: mpsc::UnboundedSender<Event>,
    bus: Weak<BusInner>,
    next_serial: AtomicU32,
    open: AtomicBool,
}

impl MemoryConnection {
    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        lock_state(&self.state)
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn stamp(&self, mut message: BusMessage) -> BusMessage {
        let serial = Serial::new(self.next_serial.fetch_add(1, Ordering::SeqCst));
        message.serial = Some(serial);
        message.sender = Some(self.name.clone());
        message
    }

    fn route(&self, message: BusMessage) -> Result<(), TransportError> {
        let bus = self.bus.upgrade().ok_or(TransportError::Closed)?;
        bus.route(message)
    }
}

fn lock_state(state: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection for MemoryConnection {
    fn unique_name(&self) -> String {
        self.name.clone()
    }

    fn send(&self, message: BusMessage) -> Result<Serial, TransportError> {
        self.check_open()?;
        let message = self.stamp(message);
        let serial = message.serial.unwrap_or(Serial::new(0));
        trace!(connection = %self.name, %message, "Send");
        self.route(message)?;
        Ok(serial)
    }

    fn send_with_reply(
        &self,
        message: BusMessage,
        timeout: Duration,
    ) -> Result<PendingCall, TransportError> {
        self.check_open()?;
        let message = self.stamp(message);
        let serial = message.serial.unwrap_or(Serial::new(0));
        let pending = PendingCall::new(serial);

        // Track the call before routing so a fast reply always finds its slot.
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::Timeout(serial));
        });
        self.state().pending.insert(
            serial,
            PendingSlot {
                handler: None,
                reply: None,
                timer: Some(timer),
            },
        );

        trace!(connection = %self.name, %message, "Send with reply");
        if let Err(e) = self.route(message) {
            if let Some(slot) = self.state().pending.remove(&serial) {
                if let Some(timer) = slot.timer {
                    timer.abort();
                }
            }
            return Err(e);
        }
        Ok(pending)
    }

    fn set_pending_call_reply_handler(
        &self,
        pending: &PendingCall,
        handler: Arc<dyn ReplyHandler>,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        let serial = pending.serial();
        let slot = state
            .pending
            .get_mut(&serial)
            .ok_or(TransportError::UnknownPendingCall(serial))?;
        if slot.reply.is_some() {
            // Already completed: hand the stored reply over on the dispatch task.
            if let Some(PendingSlot {
                reply: Some(reply), ..
            }) = state.pending.remove(&serial)
            {
                let _ = self.events.send(Event::Reply {
                    pending: *pending,
                    handler,
                    reply,
                });
            }
        } else {
            slot.handler = Some(handler);
        }
        Ok(())
    }

    fn cancel_pending_call(&self, pending: &PendingCall) {
        if let Some(slot) = self.state().pending.remove(&pending.serial()) {
            if let Some(timer) = slot.timer {
                timer.abort();
            }
            debug!(connection = %self.name, serial = %pending.serial(), "Pending call cancelled");
        }
    }

    fn add_object_path_handler(
        &self,
        path: &ObjectPath,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.state();
        if state.objects.contains_key(path) {
            return Err(TransportError::PathInUse(path.clone()));
        }
        state.objects.insert(path.clone(), handler);
        Ok(())
    }

    fn remove_object_path_handler(&self, path: &ObjectPath) -> Result<(), TransportError> {
        let handler = self
            .state()
            .objects
            .remove(path)
            .ok_or_else(|| TransportError::NoHandler(path.clone()))?;
        let _ = self.events.send(Event::Unregister(handler));
        Ok(())
    }

    fn add_filter(&self, handler: Arc<dyn MessageHandler>) -> Result<FilterId, TransportError> {
        self.check_open()?;
        let mut state = self.state();
        state.next_filter += 1;
        let id = FilterId::new(state.next_filter);
        state.filters.push((id, handler));
        Ok(id)
    }

    fn remove_filter(&self, id: FilterId) -> Result<(), TransportError> {
        let mut state = self.state();
        let index = state
            .filters
            .iter()
            .position(|(filter, _)| *filter == id)
            .ok_or(TransportError::UnknownFilter(id))?;
        let (_, handler) = state.filters.remove(index);
        let _ = self.events.send(Event::Unregister(handler));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.peers().remove(&self.name);
        }

        let mut state = self.state();
        for (path, handler) in state.objects.drain() {
            debug!(connection = %self.name, %path, "Unregistering on close");
            let _ = self.events.send(Event::Unregister(handler));
        }
        for (_, handler) in state.filters.drain(..) {
            let _ = self.events.send(Event::Unregister(handler));
        }
        for (serial, slot) in state.pending.drain() {
            if let Some(timer) = slot.timer {
                timer.abort();
            }
            if let Some(handler) = slot.handler {
                let reply = BusMessage::error_reply(
                    Some(serial),
                    Some(self.name.clone()),
                    ERROR_DISCONNECTED,
                    "Connection was closed",
                );
                let _ = self.events.send(Event::Reply {
                    pending: PendingCall::new(serial),
                    handler,
                    reply,
                });
            }
        }
        drop(state);

        let _ = self.events.send(Event::Shutdown);
        info!(connection = %self.name, "Connection closed");
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// The dispatch task of one connection.
struct Dispatcher {
    name: String,
    state: Arc<Mutex<ConnectionState>>,
    bus: Weak<BusInner>,
}

impl Dispatcher {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<Event>) {
        debug!(connection = %self.name, "Dispatch loop started");
        while let Some(event) = receiver.recv().await {
            match event {
                Event::Incoming(message) if message.is_reply() => self.complete_call(message),
                Event::Incoming(message) => self.dispatch(message),
                Event::Timeout(serial) => {
                    let reply = BusMessage::error_reply(
                        Some(serial),
                        Some(self.name.clone()),
                        ERROR_NO_REPLY,
                        "Did not receive a reply before the timeout expired",
                    );
                    self.complete_call(reply);
                }
                Event::Reply {
                    pending,
                    handler,
                    reply,
                } => handler.handle_reply(pending, reply),
                Event::Unregister(handler) => handler.unregister(),
                Event::Shutdown => break,
            }
        }
        debug!(connection = %self.name, "Dispatch loop stopped");
    }

    /// Completes a pending call. At most one completion is ever delivered:
    /// whichever of reply or timeout arrives first wins.
    fn complete_call(&self, reply: BusMessage) {
        let Some(serial) = reply.reply_serial else {
            warn!(connection = %self.name, %reply, "Reply without reply serial");
            return;
        };
        let mut state = lock_state(&self.state);
        let Some(slot) = state.pending.get_mut(&serial) else {
            debug!(connection = %self.name, %serial, "Reply for unknown or cancelled call dropped");
            return;
        };
        if slot.reply.is_some() {
            return;
        }
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        if slot.handler.is_none() {
            slot.reply = Some(reply);
            return;
        }
        let handler = state
            .pending
            .remove(&serial)
            .and_then(|slot| slot.handler);
        drop(state);

        if let Some(handler) = handler {
            handler.handle_reply(PendingCall::new(serial), reply);
        }
    }

    fn dispatch(&self, message: BusMessage) {
        let (filters, object) = {
            let state = lock_state(&self.state);
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
            let path = message
                .path
                .as_ref()
                .map(ObjectPath::to_string)
                .unwrap_or_default();
            debug!(connection = %self.name, %path, "No handler for method call");
            let mut reply = BusMessage::error(
                &message,
                ERROR_UNKNOWN_OBJECT,
                format!("No such object path '{path}'"),
            );
            reply.sender = Some(self.name.clone());
            if let Some(bus) = self.bus.upgrade() {
                let _ = bus.route(reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MessageKind, Value};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    struct Recorder {
        seen: UnboundedSender<BusMessage>,
        result: HandlerResult,
    }

    impl MessageHandler for Recorder {
        fn handle_message(&self, message: &BusMessage) -> HandlerResult {
            let _ = self.seen.send(message.clone());
            self.result
        }
    }

    struct ReplySink(UnboundedSender<(PendingCall, BusMessage)>);

    impl ReplyHandler for ReplySink {
        fn handle_reply(&self, pending: PendingCall, reply: BusMessage) {
            let _ = self.0.send((pending, reply));
        }
    }

    struct UnregisterCounter(StdMutex<u32>);

    impl MessageHandler for UnregisterCounter {
        fn handle_message(&self, _: &BusMessage) -> HandlerResult {
            HandlerResult::Handled
        }
        fn unregister(&self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn path(p: &str) -> ObjectPath {
        ObjectPath::parse(p).unwrap()
    }

    #[tokio::test]
    async fn test_call_routed_to_object_handler() {
        let bus = MemoryBus::new();
        let server = bus.connect();
        let client = bus.connect();
        let (seen, mut received) = unbounded_channel();
        server
            .add_object_path_handler(
                &path("/svc"),
                Arc::new(Recorder {
                    seen,
                    result: HandlerResult::Handled,
                }),
            )
            .unwrap();

        let call = BusMessage::method_call(server.unique_name(), path("/svc"), "com.example.I", "Ping")
            .with_arg("hello");
        client.send(call).unwrap();

        let message = received.recv().await.unwrap();
        assert_eq!(message.member.as_deref(), Some("Ping"));
        assert_eq!(message.sender, Some(client.unique_name()));
        assert_eq!(message.body, vec![Value::from("hello")]);
    }

    #[tokio::test]
    async fn test_unknown_object_gets_error_reply() {
        let bus = MemoryBus::new();
        let server = bus.connect();
        let client = bus.connect();
        let (tx, mut replies) = unbounded_channel();

        let call = BusMessage::method_call(server.unique_name(), path("/nobody"), "com.example.I", "Ping");
        let pending = client.send_with_reply(call, Duration::from_secs(5)).unwrap();
        client
            .set_pending_call_reply_handler(&pending, Arc::new(ReplySink(tx)))
            .unwrap();

        let (completed, reply) = replies.recv().await.unwrap();
        assert_eq!(completed, pending);
        assert_eq!(reply.kind, MessageKind::Error);
        assert_eq!(reply.error_name.as_deref(), Some(ERROR_UNKNOWN_OBJECT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_synthesizes_no_reply() {
        let bus = MemoryBus::new();
        let server = bus.connect();
        let client = bus.connect();
        // A filter that swallows the call so no error reply is produced.
        let (seen, _received) = unbounded_channel();
        server
            .add_filter(Arc::new(Recorder {
                seen,
                result: HandlerResult::Handled,
            }))
            .unwrap();
        let (tx, mut replies) = unbounded_channel();

        let call = BusMessage::method_call(server.unique_name(), path("/slow"), "com.example.I", "Wait");
        let pending = client.send_with_reply(call, Duration::from_millis(100)).unwrap();
        client
            .set_pending_call_reply_handler(&pending, Arc::new(ReplySink(tx)))
            .unwrap();

        let (_, reply) = replies.recv().await.unwrap();
        assert_eq!(reply.error_name.as_deref(), Some(ERROR_NO_REPLY));
        assert_eq!(reply.reply_serial, Some(pending.serial()));
    }

    #[tokio::test]
    async fn test_reply_before_handler_is_kept() {
        let bus = MemoryBus::new();
        let server = bus.connect();
        let client = bus.connect();
        let (tx, mut replies) = unbounded_channel();

        let call = BusMessage::method_call(server.unique_name(), path("/nobody"), "com.example.I", "Ping");
        let pending = client.send_with_reply(call, Duration::from_secs(5)).unwrap();
        // Let the error reply arrive before installing the handler.
        tokio::time::sleep(Duration::from_millis(50)).await;
        client
            .set_pending_call_reply_handler(&pending, Arc::new(ReplySink(tx)))
            .unwrap();

        let (_, reply) = replies.recv().await.unwrap();
        assert_eq!(reply.error_name.as_deref(), Some(ERROR_UNKNOWN_OBJECT));
    }

    #[tokio::test]
    async fn test_path_in_use_and_unregister_on_close() {
        let bus = MemoryBus::new();
        let conn = bus.connect();
        let handler = Arc::new(UnregisterCounter(StdMutex::new(0)));
        conn.add_object_path_handler(&path("/a"), handler.clone()).unwrap();

        let second = conn.add_object_path_handler(&path("/a"), handler.clone());
        assert_eq!(second, Err(TransportError::PathInUse(path("/a"))));

        conn.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*handler.0.lock().unwrap(), 1);
        assert_eq!(
            conn.add_object_path_handler(&path("/b"), handler.clone()),
            Err(TransportError::Closed)
        );
        assert_eq!(bus.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_signals_are_broadcast() {
        let bus = MemoryBus::new();
        let emitter = bus.connect();
        let listener_a = bus.connect();
        let listener_b = bus.connect();
        let (seen_a, mut rx_a) = unbounded_channel();
        let (seen_b, mut rx_b) = unbounded_channel();
        listener_a
            .add_filter(Arc::new(Recorder {
                seen: seen_a,
                result: HandlerResult::NotYetHandled,
            }))
            .unwrap();
        listener_b
            .add_filter(Arc::new(Recorder {
                seen: seen_b,
                result: HandlerResult::NotYetHandled,
            }))
            .unwrap();

        emitter
            .send(BusMessage::signal(path("/sensor"), "com.example.Sensor", "Reading"))
            .unwrap();

        assert!(rx_a.recv().await.unwrap().is_signal());
        assert!(rx_b.recv().await.unwrap().is_signal());
    }
}
