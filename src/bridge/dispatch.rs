//! # Bus-Side Callbacks
//!
//! The handlers the bridge installs on its connection. Each one carries its
//! own context (the resource it serves, or the token of the call it waits
//! for) plus a weak reference back to the bridge, so a connection holding
//! stale handlers never keeps a dropped bridge alive.
//!
//! All of them run on the connection's dispatch loop. None of them blocks:
//! delivery is a mailbox enqueue and nothing more.

use super::resource::BridgeResource;
use super::BridgeCore;
use crate::bus::{
    BusMessage, HandlerResult, MatchRule, MessageHandler, MessageKind, PendingCall,
    ReplyHandler, ERROR_FAILED, ERROR_NO_REPLY,
};
use crate::process::{
    CallReply, CallToken, IncomingMessage, MailboxMessage, MalformedMessage, MessageHeader,
    ReplyOutcome,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Enforces that at most one bridge callback is active at a time.
///
/// Connections promise a single dispatch loop; a second callback entering
/// while one is running means that promise was broken, and the callback is
/// refused instead of racing on the registry.
#[derive(Debug, Default)]
pub(crate) struct CallbackGuard {
    active: AtomicBool,
}

impl CallbackGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(&self) -> Option<CallbackScope<'_>> {
        if self.active.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(CallbackScope { guard: self })
        }
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub(crate) struct CallbackScope<'a> {
    guard: &'a CallbackGuard,
}

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        self.guard.active.store(false, Ordering::Release);
    }
}

impl<P: Send + Sync + 'static> BridgeCore<P> {
    /// Converts `message` and enqueues it for the resource's owner.
    /// Returns `false` if nothing was delivered.
    fn deliver(&self, resource: &Arc<BridgeResource<P>>, message: &BusMessage) -> bool {
        if resource.is_released() {
            return false;
        }
        let owner = resource.owner();
        if !self.runtime.is_alive(owner) {
            debug!(path = %resource.path(), %owner, "Owner is gone, message dropped");
            self.evict(resource);
            return false;
        }

        let header = MessageHeader::from(message);
        let delivery = match self.codec.decode_body(&message.body) {
            Ok(args) => MailboxMessage::Incoming(IncomingMessage { header, args }),
            Err(error) => {
                warn!(path = %resource.path(), %owner, %message, %error, "Undecodable message");
                MailboxMessage::Malformed(MalformedMessage {
                    header,
                    token: None,
                    payload: None,
                    error,
                })
            }
        };

        match self.runtime.mailbox_send(owner, delivery) {
            Ok(()) => {
                debug!(path = %resource.path(), %owner, %message, "Delivered");
                true
            }
            Err(e) => {
                debug!(path = %resource.path(), %owner, error = %e, "Delivery failed");
                self.evict(resource);
                false
            }
        }
    }

    /// Whether `reply` was produced by our own connection (a timeout or a
    /// disconnect) rather than sent by a peer.
    fn is_synthesized(&self, reply: &BusMessage) -> bool {
        match &reply.sender {
            None => true,
            Some(sender) => *sender == self.connection.unique_name(),
        }
    }

    /// Routes the completion of an outgoing call to its caller. The context
    /// is consumed whether or not anything is delivered.
    fn complete_call(&self, token: CallToken, reply: BusMessage) {
        let Some(context) = self.pending().take(token) else {
            debug!(%token, "Reply for abandoned call dropped");
            return;
        };
        let caller = context.caller;
        if !self.runtime.is_alive(caller) {
            debug!(%token, %caller, "Caller is gone, reply dropped");
            return;
        }

        let timed_out =
            reply.error_name.as_deref() == Some(ERROR_NO_REPLY) && self.is_synthesized(&reply);
        let delivery = if timed_out {
            MailboxMessage::Reply(CallReply {
                token,
                payload: context.payload,
                outcome: ReplyOutcome::Timeout,
            })
        } else {
            match self.codec.decode_body(&reply.body) {
                Ok(args) => {
                    let outcome = match reply.kind {
                        MessageKind::Error => ReplyOutcome::Error {
                            name: reply
                                .error_name
                                .clone()
                                .unwrap_or_else(|| ERROR_FAILED.to_string()),
                            args,
                        },
                        _ => ReplyOutcome::Return(args),
                    };
                    MailboxMessage::Reply(CallReply {
                        token,
                        payload: context.payload,
                        outcome,
                    })
                }
                Err(error) => {
                    warn!(%token, %caller, %reply, %error, "Undecodable reply");
                    MailboxMessage::Malformed(MalformedMessage {
                        header: MessageHeader::from(&reply),
                        token: Some(token),
                        payload: context.payload,
                        error,
                    })
                }
            }
        };

        match self.runtime.mailbox_send(caller, delivery) {
            Ok(()) => debug!(%token, %caller, "Reply delivered"),
            Err(e) => debug!(%token, %caller, error = %e, "Reply delivery failed"),
        }
    }
}

/// Object path handler for one registered resource.
pub(crate) struct ObjectBinding<P> {
    core: Weak<BridgeCore<P>>,
    resource: Arc<BridgeResource<P>>,
}

impl<P> ObjectBinding<P> {
    pub(crate) fn new(core: Weak<BridgeCore<P>>, resource: Arc<BridgeResource<P>>) -> Self {
        Self { core, resource }
    }
}

impl<P: Send + Sync + 'static> MessageHandler for ObjectBinding<P> {
    fn handle_message(&self, message: &BusMessage) -> HandlerResult {
        let Some(core) = self.core.upgrade() else {
            return HandlerResult::NotYetHandled;
        };
        let Some(_scope) = core.guard.enter() else {
            error!(path = %self.resource.path(), %message, "Re-entrant dispatch refused");
            return HandlerResult::NotYetHandled;
        };
        if core.deliver(&self.resource, message) {
            HandlerResult::Handled
        } else {
            HandlerResult::NotYetHandled
        }
    }

    fn unregister(&self) {
        let Some(core) = self.core.upgrade() else {
            self.resource.release();
            return;
        };
        let scope = core.guard.enter();
        if scope.is_none() {
            error!(path = %self.resource.path(), "Unregister entered while another callback is active");
        }
        core.registry().remove_if_same(&self.resource);
        self.resource.release();
    }
}

/// Connection filter installed by a subscription. Never consumes a message,
/// so other filters and the object handler still see it.
pub(crate) struct SubscriptionBinding<P> {
    core: Weak<BridgeCore<P>>,
    resource: Arc<BridgeResource<P>>,
    rule: MatchRule,
}

impl<P> SubscriptionBinding<P> {
    pub(crate) fn new(
        core: Weak<BridgeCore<P>>,
        resource: Arc<BridgeResource<P>>,
        rule: MatchRule,
    ) -> Self {
        Self {
            core,
            resource,
            rule,
        }
    }
}

impl<P: Send + Sync + 'static> MessageHandler for SubscriptionBinding<P> {
    fn handle_message(&self, message: &BusMessage) -> HandlerResult {
        if !self.rule.matches(message) {
            return HandlerResult::NotYetHandled;
        }
        let Some(core) = self.core.upgrade() else {
            return HandlerResult::NotYetHandled;
        };
        match core.guard.enter() {
            Some(_scope) => {
                core.deliver(&self.resource, message);
            }
            None => error!(path = %self.resource.path(), %message, "Re-entrant dispatch refused"),
        }
        HandlerResult::NotYetHandled
    }
}

/// Reply handler for one outgoing call.
pub(crate) struct ReplyBinding<P> {
    core: Weak<BridgeCore<P>>,
    token: CallToken,
}

impl<P> ReplyBinding<P> {
    pub(crate) fn new(core: Weak<BridgeCore<P>>, token: CallToken) -> Self {
        Self { core, token }
    }
}

impl<P: Send + Sync + 'static> ReplyHandler for ReplyBinding<P> {
    fn handle_reply(&self, pending: PendingCall, reply: BusMessage) {
        let Some(core) = self.core.upgrade() else {
            debug!(token = %self.token, "Bridge dropped, reply discarded");
            return;
        };
        debug_assert_eq!(pending.serial(), self.token.serial());
        let Some(_scope) = core.guard.enter() else {
            error!(token = %self.token, "Re-entrant reply refused");
            core.pending().take(self.token);
            return;
        };
        core.complete_call(self.token, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_refuses_nested_entry() {
        let guard = CallbackGuard::new();
        {
            let outer = guard.enter();
            assert!(outer.is_some());
            assert!(guard.enter().is_none());
            assert!(guard.is_active());
        }
        assert!(!guard.is_active());
        assert!(guard.enter().is_some());
    }
}
