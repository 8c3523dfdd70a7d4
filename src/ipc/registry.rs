//! In-flight call registry.
//!
//! SPDK's responses carry the request id but not the method, so the method
//! name is remembered here from the moment a request is sent until its
//! response header is parsed. Each entry also holds the waiter's reply
//! channel.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::value::RawValue;
use tokio::sync::oneshot;

use crate::ipc::client::RpcError;

/// What a waiting caller eventually receives.
pub(crate) type Reply = Result<Box<RawValue>, RpcError>;

/// A call that has been registered but not answered.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub method: String,
    reply: oneshot::Sender<Reply>,
}

impl PendingCall {
    /// Hand the reply to the waiter.
    ///
    /// Returns `false` if the caller already gave up on the call.
    pub fn complete(self, reply: Reply) -> bool {
        self.reply.send(reply).is_ok()
    }
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<u64, PendingCall>,
    closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    state: Mutex<State>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Entries stay consistent even if a holder panicked mid-update.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a call about to be written.
    ///
    /// # Errors
    ///
    /// - `RpcError::Closed` once [`Registry::drain`] has run
    /// - `RpcError::Protocol` if the id is already in flight
    pub fn register(&self, id: u64, method: &str) -> Result<oneshot::Receiver<Reply>, RpcError> {
        let mut state = self.state();
        if state.closed {
            return Err(RpcError::Closed);
        }
        if state.pending.contains_key(&id) {
            return Err(RpcError::Protocol(format!("request id {id} is already in flight")));
        }

        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                reply: tx,
            },
        );
        Ok(rx)
    }

    /// Remove and return the call registered under `id`.
    pub fn resolve(&self, id: u64) -> Option<PendingCall> {
        self.state().pending.remove(&id)
    }

    /// Close the registry and take every remaining call, ordered by id.
    ///
    /// Later registrations fail with `RpcError::Closed`.
    pub fn drain(&self) -> Vec<(u64, PendingCall)> {
        let mut state = self.state();
        state.closed = true;
        let mut calls: Vec<_> = state.pending.drain().collect();
        calls.sort_by_key(|(id, _)| *id);
        calls
    }

    /// Whether `id` is registered and its caller still waits for the reply.
    pub fn is_waiting(&self, id: u64) -> bool {
        self.state()
            .pending
            .get(&id)
            .is_some_and(|call| !call.reply.is_closed())
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().pending.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}
