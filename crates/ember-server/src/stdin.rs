//! Gated stdin for executing code.
//!
//! Input is only available while an execute request that allowed it is in
//! progress. A read sends `input_request` on the stdin channel and blocks
//! until the matching `input_reply` arrives or the request ends.

use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ember_core::{Error, StdinSource};

use crate::protocol::{Channel, Header, InputReply, InputRequest, msg_type};
use crate::sink::Outbox;

#[derive(Default)]
struct GateState {
    /// Request that currently owns stdin, if it allowed input.
    parent: Option<Header>,
    pending: Option<mpsc::Sender<String>>,
}

/// Stdin shared by all executions of a kernel.
pub struct StdinGate {
    outbox: Outbox,
    state: Mutex<GateState>,
}

impl StdinGate {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            state: Mutex::new(GateState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open stdin for the request `parent`. Closed again when the scope drops.
    pub fn open(&self, parent: &Header, allow: bool) -> StdinScope<'_> {
        let mut state = self.state();
        state.parent = allow.then(|| parent.clone());
        state.pending = None;
        StdinScope { gate: self }
    }

    fn close(&self) {
        let mut state = self.state();
        state.parent = None;
        // Dropping the sender wakes a blocked read with a cancellation.
        state.pending = None;
    }

    /// Hand an `input_reply` to the pending read.
    pub fn deliver(&self, reply: InputReply) -> bool {
        match self.state().pending.take() {
            Some(tx) => tx.send(reply.value).is_ok(),
            None => {
                tracing::debug!("input_reply with no pending read ignored");
                false
            }
        }
    }

    /// Whether a read is waiting for the front-end.
    pub fn is_waiting(&self) -> bool {
        self.state().pending.is_some()
    }
}

impl StdinSource for StdinGate {
    fn read_line(&self, prompt: &str, password: bool) -> ember_core::Result<String> {
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.state();
            let Some(parent) = state.parent.clone() else {
                return Err(Error::StdinDisabled);
            };
            state.pending = Some(tx);
            self.outbox.send(
                &parent,
                Channel::Stdin,
                msg_type::INPUT_REQUEST,
                &InputRequest {
                    prompt: prompt.to_string(),
                    password,
                },
            );
        }
        rx.recv().map_err(|_| Error::StdinCancelled)
    }
}

/// Keeps stdin open for one request.
pub struct StdinScope<'a> {
    gate: &'a StdinGate,
}

impl Drop for StdinScope<'_> {
    fn drop(&mut self) {
        self.gate.close();
    }
}
