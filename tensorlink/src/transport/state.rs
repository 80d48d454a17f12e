//! Connection state machine shared by the session and its background tasks.

use crate::types::ConnectionState;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// Single source of truth for a session's `ConnectionState`.
///
/// Transitions are checked against `ConnectionState::can_advance_to` and
/// applied atomically; observers wait on the watch channel.
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
    close_reason: Mutex<Option<String>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Idle);
        Self {
            tx,
            close_reason: Mutex::new(None),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Move to `next` if the current state allows it. Returns whether the
    /// transition happened.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut from = None;
        let changed = self.tx.send_if_modified(|state| {
            if state.can_advance_to(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            tracing::debug!(%from, to = %next, "connection state");
        }
        changed
    }

    /// Move from exactly `from` to `next`.
    pub fn advance_from(&self, from: ConnectionState, next: ConnectionState) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if *state == from && from.can_advance_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(%from, to = %next, "connection state");
        }
        changed
    }

    /// Jump to `Closed`, recording `reason` if no reason was recorded yet.
    /// Returns whether this call closed the connection.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        {
            let mut slot = self
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() && self.current() != ConnectionState::Closed {
                *slot = Some(reason.into());
            }
        }
        self.advance(ConnectionState::Closed)
    }

    /// Why the connection closed, if it failed.
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait until the state satisfies `pred`, returning that state.
    pub async fn wait_for(&self, pred: impl Fn(ConnectionState) -> bool) -> ConnectionState {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|s| pred(*s)).await {
            Ok(state) => *state,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.current(),
        }
    }
}
