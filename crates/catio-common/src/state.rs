//! Connection state machine for the client role.
//!
//! Lifecycle: DISCONNECTED → CONNECTING → OPEN → CLOSING → DISCONNECTED
//!
//! A failed connect falls back from CONNECTING and a lost transport drops
//! straight from OPEN to DISCONNECTED.

use crate::error::{AdsError, AdsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// States of one AMS/TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Socket being opened.
    Connecting,
    /// Requests may be issued.
    Open,
    /// Releasing handles before shutting the socket down.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
        }
    }
}

impl ConnectionState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::{Closing, Connecting, Disconnected, Open};

        matches!(
            (self, target),
            (Disconnected, Connecting)
                | (Connecting, Open)
                | (Connecting, Disconnected)
                | (Open, Closing)
                | (Open, Disconnected)
                | (Closing, Disconnected)
        )
    }

    /// Returns true if requests may be written in this state.
    ///
    /// CLOSING still accepts the handle releases issued by `close()`.
    #[must_use]
    pub fn accepts_requests(&self) -> bool {
        matches!(self, Self::Open | Self::Closing)
    }
}

/// State machine wrapper with transition history tracking.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: ConnectionState,
    previous: Option<ConnectionState>,
    transition_count: u64,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a new state machine starting in DISCONNECTED.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ConnectionState::Disconnected,
            previous: None,
            transition_count: 0,
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<ConnectionState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    pub fn transition(&mut self, target: ConnectionState) -> AdsResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(AdsError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Drop to DISCONNECTED from any state; no-op when already there.
    ///
    /// Returns true if a transition happened.
    pub fn mark_disconnected(&mut self) -> bool {
        if self.current == ConnectionState::Disconnected {
            return false;
        }
        self.previous = Some(self.current);
        self.current = ConnectionState::Disconnected;
        self.transition_count += 1;
        true
    }
}
