//! # Bus Client
//!
//! [`BusClient`] wraps a process mailbox and a [`Bridge`] to give the
//! request/response feel of an ordinary async call: issue through the bridge,
//! then wait for the reply carrying the returned token.
//!
//! Waiting is a selective receive. Whatever else lands in the mailbox in the
//! meantime stays queued, in order, for [`BusClient::mailbox`].

use crate::bridge::{Bridge, OutgoingCall};
use crate::codec::ConversionError;
use crate::error::BridgeError;
use crate::process::{Mailbox, MailboxMessage, Pid, ReplyOutcome};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    /// The reply arrived but could not be decoded.
    #[error("Malformed reply: {0}")]
    Malformed(ConversionError),
    /// The process was terminated while waiting.
    #[error("Mailbox closed")]
    MailboxClosed,
}

/// A process issuing bus calls and awaiting their replies.
pub struct BusClient<P = ()> {
    bridge: Bridge<P>,
    mailbox: Mailbox,
}

impl<P: Send + Sync + 'static> BusClient<P> {
    pub fn new(bridge: Bridge<P>, mailbox: Mailbox) -> Self {
        Self { bridge, mailbox }
    }

    pub fn pid(&self) -> Pid {
        self.mailbox.pid()
    }

    /// Messages that are not replies to calls made through this client.
    pub fn mailbox(&mut self) -> &mut Mailbox {
        &mut self.mailbox
    }

    /// Issues `call` and waits for its outcome. Timeouts are reported as
    /// [`ReplyOutcome::Timeout`], not as an error.
    pub async fn call(&mut self, call: OutgoingCall) -> Result<ReplyOutcome, ClientError> {
        let token = self.bridge.call(self.mailbox.pid(), call)?;
        debug!(%token, pid = %self.mailbox.pid(), "Waiting for reply");
        match self.mailbox.recv_reply(token).await {
            Some(MailboxMessage::Reply(reply)) => Ok(reply.outcome),
            Some(MailboxMessage::Malformed(malformed)) => {
                Err(ClientError::Malformed(malformed.error))
            }
            Some(MailboxMessage::Incoming(_)) | None => Err(ClientError::MailboxClosed),
        }
    }

    pub fn into_inner(self) -> (Bridge<P>, Mailbox) {
        (self.bridge, self.mailbox)
    }
}
