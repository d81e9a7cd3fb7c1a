//! FIFO admission for transactions.
//!
//! Callers take a ticket and wait until it is served, so transactions on one
//! document run one at a time in the order they were started.

use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::error::{Error, Result};

#[derive(Default)]
struct GateState {
    next_ticket: u64,
    serving: u64,
    owner: Option<ThreadId>,
}

#[derive(Default)]
pub(crate) struct Gate {
    state: Mutex<GateState>,
    turn: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for our turn. Fails if this thread already holds the gate.
    pub(crate) fn enter(&self) -> Result<GateGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.owner == Some(me) {
            return Err(Error::ReentrantTransaction);
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.serving != ticket {
            state = self
                .turn
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.owner = Some(me);
        Ok(GateGuard { gate: self })
    }

    pub(crate) fn is_held_by_current_thread(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.owner == Some(thread::current().id())
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .gate
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.owner = None;
        state.serving += 1;
        self.gate.turn.notify_all();
    }
}
