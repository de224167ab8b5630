//! Pending-call contexts: who issued which outgoing call, keyed by the
//! correlation token.

use crate::bus::PendingCall;
use crate::process::{CallToken, Pid, Term};
use std::collections::{HashMap, HashSet};

/// Everything needed to route a reply back to its caller.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCallContext {
    pub caller: Pid,
    pub token: CallToken,
    pub payload: Option<Term>,
    pub pending: PendingCall,
}

/// Contexts are consumed by [`take`](PendingCalls::take) on the first reply,
/// or dropped in bulk when their caller dies.
#[derive(Debug, Default)]
pub struct PendingCalls {
    by_token: HashMap<CallToken, PendingCallContext>,
    by_caller: HashMap<Pid, HashSet<CallToken>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, context: PendingCallContext) {
        self.by_caller
            .entry(context.caller)
            .or_default()
            .insert(context.token);
        self.by_token.insert(context.token, context);
    }

    pub fn take(&mut self, token: CallToken) -> Option<PendingCallContext> {
        let context = self.by_token.remove(&token)?;
        if let Some(tokens) = self.by_caller.get_mut(&context.caller) {
            tokens.remove(&token);
            if tokens.is_empty() {
                self.by_caller.remove(&context.caller);
            }
        }
        Some(context)
    }

    pub fn remove_caller(&mut self, caller: Pid) -> Vec<PendingCallContext> {
        let Some(tokens) = self.by_caller.remove(&caller) else {
            return Vec::new();
        };
        tokens
            .into_iter()
            .filter_map(|token| self.by_token.remove(&token))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<PendingCallContext> {
        self.by_caller.clear();
        self.by_token.drain().map(|(_, context)| context).collect()
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }
}

#[cfg(test)]
impl PendingCalls {
    pub fn issued_by(&self, caller: Pid) -> usize {
        self.by_caller.get(&caller).map_or(0, HashSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Serial;

    fn context(caller: u64, serial: u32) -> PendingCallContext {
        PendingCallContext {
            caller: Pid::from_raw(caller),
            token: CallToken::new(Serial::new(serial)),
            payload: Some(Term::from("tag")),
            pending: PendingCall::new(Serial::new(serial)),
        }
    }

    #[test]
    fn test_take_consumes_once() {
        let mut calls = PendingCalls::new();
        calls.insert(context(1, 10));
        let token = CallToken::new(Serial::new(10));

        let taken = calls.take(token).unwrap();
        assert_eq!(taken.payload, Some(Term::from("tag")));
        assert!(calls.take(token).is_none());
        assert_eq!(calls.issued_by(Pid::from_raw(1)), 0);
        assert!(calls.is_empty());
    }

    #[test]
    fn test_remove_caller() {
        let mut calls = PendingCalls::new();
        calls.insert(context(1, 10));
        calls.insert(context(1, 11));
        calls.insert(context(2, 12));

        let removed = calls.remove_caller(Pid::from_raw(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(calls.len(), 1);
        assert!(calls.take(CallToken::new(Serial::new(12))).is_some());
    }
}
