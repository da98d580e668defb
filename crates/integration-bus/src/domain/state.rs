//! # Connection State Machine
//!
//! Every change to the broker connection lifecycle goes through
//! [`ConnectionStateMachine::transition`], so reconnect storms and races
//! between broker notifications reduce to a table of legal edges.
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 ▼                              │
//! [Disconnected] ──→ [Connecting] ──→ [Connected] ──→ [ShuttingDown]
//!                        │    ▲                            │
//!                        │    └────────────────────────────┘
//!                        └──→ [Disconnected]
//!
//!               any state ──dispose──→ [Disposed] (terminal)
//! ```

use parking_lot::Mutex;
use tracing::debug;

use super::errors::TransitionError;

/// Lifecycle of the single physical broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection has been established, or every attempt failed.
    Disconnected,
    /// A connect attempt (with retries) is in flight.
    Connecting,
    /// A connection is open.
    Connected,
    /// The broker reported shutdown, a callback exception or a block.
    ShuttingDown,
    /// Deliberately torn down; no further reconnects.
    Disposed,
}

impl ConnectionState {
    /// Whether `self -> to` is a legal edge.
    #[must_use]
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, to) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Disconnected) => true,
            (Connected, ShuttingDown) => true,
            (ShuttingDown, Connecting) => true,
            _ => false,
        }
    }
}

/// Single mutator guarding the current [`ConnectionState`].
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: Mutex<ConnectionState>,
}

impl ConnectionStateMachine {
    /// Create a machine in the `Disconnected` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `to` if the edge is legal.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] and leaves the state untouched otherwise.
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState, TransitionError> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }
        *state = to;
        debug!(?from, ?to, "Connection state transition");
        Ok(from)
    }

    /// Move to `to` only when currently in `from`.
    ///
    /// Returns `true` if the transition happened.
    pub fn transition_from(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state != from || !from.can_transition_to(to) {
            return false;
        }
        *state = to;
        debug!(?from, ?to, "Connection state transition");
        true
    }

    /// Enter `Connecting` from whatever non-terminal state we are in.
    ///
    /// Covers a `Connected` machine whose link died without a broker
    /// notification. Returns `false` once disposed.
    pub fn begin_connect(&self) -> bool {
        let mut state = self.state.lock();
        let from = *state;
        let next = match from {
            ConnectionState::Disposed => return false,
            ConnectionState::Connecting => return true,
            ConnectionState::Connected
            | ConnectionState::Disconnected
            | ConnectionState::ShuttingDown => ConnectionState::Connecting,
        };
        *state = next;
        debug!(?from, to = ?next, "Connection state transition");
        true
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
