//! Session lifecycle state machine.
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──handshake ok──▶ Open
//!                      │    ▲                        │
//!                      │    └─────── link lost ──────┤
//!                      │                             │ disconnect
//!                      ├──────── disconnect ───────▶ Closing ──▶ Closed
//!                      └──────── error ────────────▶ Failed
//! ```
//!
//! `Closed` and `Failed` are terminal. Any non-terminal state may move to
//! `Failed` on an unretryable error.

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

use super::base::{SessionError, SessionResult};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionState {
    /// Created, nothing opened yet
    #[default]
    Idle,
    /// Opening the transport, either for the first time or after a drop
    Connecting,
    /// Transport open and handshake done
    Open,
    /// Disconnect requested, tasks winding down
    Closing,
    /// Cleanly closed
    Closed,
    /// Gave up: unretryable error or retries exhausted
    Failed,
}

impl SessionState {
    /// `Closed` and `Failed` never transition again.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// True once the session will not carry traffic again.
    #[inline]
    pub fn is_shutting_down(self) -> bool {
        matches!(
            self,
            SessionState::Closing | SessionState::Closed | SessionState::Failed
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Idle, Connecting) => true,
            (Connecting, Open) | (Connecting, Closing) => true,
            (Open, Connecting) | (Open, Closing) => true,
            (Closing, Closed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Open => write!(f, "Open"),
            SessionState::Closing => write!(f, "Closing"),
            SessionState::Closed => write!(f, "Closed"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Observable holder for a session's state.
///
/// Every transition is published on a watch channel, which is how the
/// background tasks and blocked callers learn about shutdown.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        Self { tx }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the previous state.
    pub(crate) fn transition(&self, next: SessionState) -> SessionResult<SessionState> {
        let mut outcome = Err(SessionError::IllegalTransition {
            from: SessionState::Idle,
            to: next,
        });

        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                outcome = Ok(*current);
                *current = next;
                true
            } else {
                outcome = Err(SessionError::IllegalTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });

        outcome
    }

    /// Move to `next` only if the current state is `expected`.
    pub(crate) fn transition_from(
        &self,
        expected: SessionState,
        next: SessionState,
    ) -> SessionResult<()> {
        let mut outcome = Ok(());

        self.tx.send_if_modified(|current| {
            if *current == expected && current.can_transition_to(next) {
                *current = next;
                true
            } else {
                outcome = Err(SessionError::IllegalTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });

        outcome
    }
}

/// Wait until the watched state satisfies `predicate`.
///
/// Returns the matching state, or `None` if the sender went away.
pub(crate) async fn wait_for_state<F>(
    rx: &mut watch::Receiver<SessionState>,
    predicate: F,
) -> Option<SessionState>
where
    F: Fn(SessionState) -> bool,
{
    rx.wait_for(|state| predicate(*state)).await.ok().map(|s| *s)
}
