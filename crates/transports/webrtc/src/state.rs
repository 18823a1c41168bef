//! Per-role connection state machine
//!
//! ```text
//!   New ──► Negotiating ──► Connected ◄──► Disconnected
//!                │              │               │
//!                └──────────────┴───────┬───────┘
//!                                       ▼
//!                                    Failed
//! ```
//!
//! Every state may move to Closed, and Closed re-enters Negotiating when the
//! role is re-initialized. New and Closed may also fail directly when
//! initialization is rejected before any network call.

use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of one role's peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing started yet
    New,
    /// Token, session and SDP/ICE exchange in progress
    Negotiating,
    /// Media path established
    Connected,
    /// Connectivity lost; may recover to Connected
    Disconnected,
    /// Terminal until re-initialized
    Failed,
    /// Torn down
    Closed,
}

impl ConnectionState {
    /// Check whether a session is live (initialize is a no-op)
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Negotiating | ConnectionState::Connected | ConnectionState::Disconnected
        )
    }

    /// Check whether the machine may move from `self` to `next`
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (_, Closed) => *self != Closed,
            (New, Negotiating) | (Closed, Negotiating) => true,
            (Negotiating, Connected) => true,
            (Connected, Disconnected) | (Disconnected, Connected) => true,
            (New | Negotiating | Connected | Disconnected | Closed, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Observable holder of a [`ConnectionState`]
///
/// Invalid transitions are ignored, so late or duplicated peer callbacks
/// cannot move a negotiator backwards.
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::New);
        Self { tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply a transition; returns `true` only when the state changed
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut from = ConnectionState::New;
        let changed = self.tx.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(from = %from, to = %next, "Connection state transition");
        } else if from != next {
            debug!(from = %from, to = %next, "Ignoring invalid state transition");
        }
        changed
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
