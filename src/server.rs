//! # Object Server
//!
//! The runtime-side half of a bus object. A process that registered a path
//! with the [`Bridge`] receives everything as [`MailboxMessage`]s; the
//! [`ObjectServer`] turns that mailbox into calls on a [`BusObject`] and sends
//! the results back over the bus.
//!
//! ## Key Types
//!
//! - [`BusObject`]: what an exported object implements.
//! - [`ObjectServer`]: the mailbox loop driving one object.
//! - [`MethodError`]: a named bus error returned by a method.

use crate::bridge::Bridge;
use crate::bus::{ERROR_FAILED, ERROR_INVALID_ARGS, ERROR_UNKNOWN_METHOD};
use crate::process::{CallReply, IncomingMessage, Mailbox, MailboxMessage, MalformedMessage, Term};
use async_trait::async_trait;
use tracing::{debug, info, warn};

// =============================================================================
// 1. THE ABSTRACTION
// =============================================================================

/// An error answered to a method call. `name` is the bus error name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct MethodError {
    pub name: String,
    pub message: String,
}

impl MethodError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ERROR_FAILED, message)
    }

    pub fn unknown_method(message: &IncomingMessage) -> Self {
        Self::new(
            ERROR_UNKNOWN_METHOD,
            format!(
                "No method {}.{}",
                message.interface().unwrap_or_default(),
                message.member().unwrap_or_default()
            ),
        )
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ERROR_INVALID_ARGS, message)
    }
}

/// An object exported on the bus.
///
/// # Architecture Note
/// The object is owned by its server task and every hook gets `&mut self`;
/// calls are handled one at a time in mailbox order, so no locking is needed
/// for the object's state.
///
/// Only [`handle_call`](BusObject::handle_call) is required. The other hooks
/// default to logging and ignoring the message.
#[async_trait]
pub trait BusObject: Send + 'static {
    /// Handles a method call. `Ok` values become the method return, `Err`
    /// becomes an error reply. Nothing is sent if the caller asked for no
    /// reply.
    async fn handle_call(&mut self, call: &IncomingMessage) -> Result<Vec<Term>, MethodError>;

    /// A signal from one of the process's subscriptions.
    async fn handle_signal(&mut self, signal: &IncomingMessage) {
        debug!(member = signal.member().unwrap_or_default(), "Signal ignored");
    }

    /// The reply to a call this process issued through the bridge.
    async fn handle_reply(&mut self, reply: CallReply) {
        debug!(token = %reply.token, "Reply ignored");
    }

    /// A message whose arguments could not be decoded. Method calls among
    /// them have already been answered with an invalid-arguments error.
    async fn handle_malformed(&mut self, message: &MalformedMessage) {
        warn!(error = %message.error, "Malformed message ignored");
    }
}

// =============================================================================
// 2. THE SERVER LOOP
// =============================================================================

/// Drives one [`BusObject`] from its process mailbox.
pub struct ObjectServer<O, P = ()> {
    bridge: Bridge<P>,
    mailbox: Mailbox,
    object: O,
}

impl<O: BusObject, P: Send + Sync + 'static> ObjectServer<O, P> {
    pub fn new(bridge: Bridge<P>, mailbox: Mailbox, object: O) -> Self {
        Self {
            bridge,
            mailbox,
            object,
        }
    }

    /// Runs until the mailbox closes, then hands the object back. The
    /// process itself ends when the returned mailbox is dropped.
    pub async fn run(mut self) -> (O, Mailbox) {
        let pid = self.mailbox.pid();
        info!(%pid, "Object server started");

        while let Some(message) = self.mailbox.recv().await {
            match message {
                MailboxMessage::Incoming(call) if call.is_method_call() => {
                    self.serve_call(call).await;
                }
                MailboxMessage::Incoming(signal) => self.object.handle_signal(&signal).await,
                MailboxMessage::Reply(reply) => self.object.handle_reply(reply).await,
                MailboxMessage::Malformed(malformed) => {
                    if malformed.token.is_none() && malformed.header.expects_reply() {
                        let text = malformed.error.to_string();
                        if let Err(e) =
                            self.bridge
                                .reply_error(&malformed.header, ERROR_INVALID_ARGS, &text)
                        {
                            warn!(%pid, error = %e, "Failed to reject malformed call");
                        }
                    }
                    self.object.handle_malformed(&malformed).await;
                }
            }
        }

        info!(%pid, "Object server shutdown");
        (self.object, self.mailbox)
    }

    async fn serve_call(&mut self, call: IncomingMessage) {
        let member = call.member().unwrap_or_default().to_string();
        let result = self.object.handle_call(&call).await;
        if !call.header.expects_reply() {
            debug!(%member, "No reply expected");
            return;
        }
        let sent = match &result {
            Ok(values) => self.bridge.reply(&call.header, values),
            Err(error) => {
                debug!(%member, error = %error, "Method failed");
                self.bridge
                    .reply_error(&call.header, &error.name, &error.message)
            }
        };
        if let Err(e) = sent {
            warn!(%member, error = %e, "Failed to send reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, HandlerResult, MessageKind, ObjectPath, Value};
    use crate::lifecycle::BridgeConfig;
    use crate::mock::MockConnection;
    use crate::process::LocalRuntime;
    use std::sync::Arc;
    use std::time::Duration;

    struct Counter {
        count: i64,
    }

    #[async_trait]
    impl BusObject for Counter {
        async fn handle_call(&mut self, call: &IncomingMessage) -> Result<Vec<Term>, MethodError> {
            match call.member() {
                Some("Add") => {
                    let by = call.args.first().and_then(Term::as_int).ok_or_else(|| {
                        MethodError::invalid_args("expected an integer")
                    })?;
                    self.count += by as i64;
                    Ok(vec![Term::from(self.count)])
                }
                _ => Err(MethodError::unknown_method(call)),
            }
        }
    }

    fn call(serial: u32, member: &str, body: Vec<Value>) -> BusMessage {
        let mut message = BusMessage::method_call(
            ":1.1",
            ObjectPath::parse("/counter").unwrap(),
            "org.example.Counter",
            member,
        )
        .with_body(body);
        message.serial = Some(crate::bus::Serial::new(serial));
        message.sender = Some(":1.9".to_string());
        message
    }

    #[tokio::test]
    async fn test_server_replies_and_rejects() {
        let runtime = LocalRuntime::new();
        let connection = Arc::new(MockConnection::new(":1.1"));
        let bridge: Bridge = Bridge::new(
            connection.clone(),
            Arc::new(runtime.clone()),
            BridgeConfig::default(),
        );
        let mailbox = runtime.spawn_process();
        let path = ObjectPath::parse("/counter").unwrap();
        bridge.register(path, mailbox.pid(), ()).unwrap();

        assert_eq!(connection.deliver(call(1, "Add", vec![Value::Int32(5)])), HandlerResult::Handled);
        assert_eq!(connection.deliver(call(2, "Add", vec![Value::UnixFd(3)])), HandlerResult::Handled);
        assert_eq!(connection.deliver(call(3, "Reset", vec![])), HandlerResult::Handled);
        assert_eq!(
            connection.deliver(call(4, "Add", vec![Value::Int32(2)]).with_no_reply_expected(true)),
            HandlerResult::Handled
        );

        let pid = mailbox.pid();
        let server = ObjectServer::new(bridge.clone(), mailbox, Counter { count: 0 });
        let task = tokio::spawn(server.run());
        tokio::time::timeout(Duration::from_secs(1), async {
            while connection.sent().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        runtime.exit(pid);
        let (counter, _mailbox) = task.await.unwrap();
        assert_eq!(counter.count, 7);

        let sent = connection.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].kind, MessageKind::MethodReturn);
        assert_eq!(sent[0].reply_serial, Some(crate::bus::Serial::new(1)));
        assert_eq!(sent[0].body, vec![Value::Int64(5)]);
        assert_eq!(sent[1].error_name.as_deref(), Some(ERROR_INVALID_ARGS));
        assert_eq!(sent[2].error_name.as_deref(), Some(ERROR_UNKNOWN_METHOD));
    }
}
