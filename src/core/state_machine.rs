//! Test Session State Machine
//!
//! Formal lifecycle of one cable test:
//! `Idle -> Connecting -> Provisioning -> Monitoring -> {Detected | TimedOut | Stopped | Failed}`.
//! Connecting and Provisioning may also fall straight to `Failed`.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    /// No test has run, or the last one was reset
    Idle,
    /// Opening the remote session
    Connecting,
    /// Preparing the relay and launching collaborators
    Provisioning,
    /// Polling the remote streams
    Monitoring,
    /// A handshake token was seen
    Detected,
    /// Monitoring window elapsed without a token
    TimedOut,
    /// Stopped on request
    Stopped,
    /// Connection-level failure
    Failed,
}

impl SessionState {
    /// Every state, in discriminant order
    const ALL: [SessionState; 8] = [
        Self::Idle,
        Self::Connecting,
        Self::Provisioning,
        Self::Monitoring,
        Self::Detected,
        Self::TimedOut,
        Self::Stopped,
        Self::Failed,
    ];

    /// Check if state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Detected | Self::TimedOut | Self::Stopped | Self::Failed
        )
    }

    /// Check if a worker is driving this state
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Provisioning | Self::Monitoring)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Provisioning => "provisioning",
            Self::Monitoring => "monitoring",
            Self::Detected => "detected",
            Self::TimedOut => "timed out",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Latest state of a session, published by the worker and read by
/// anyone without taking a lock
#[derive(Debug, Default)]
pub struct AtomicSessionState(AtomicU8);

impl AtomicSessionState {
    /// Publish `state`
    pub fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Last published state
    pub fn load(&self) -> SessionState {
        let index = usize::from(self.0.load(Ordering::Acquire));
        SessionState::ALL
            .get(index)
            .copied()
            .unwrap_or(SessionState::Failed)
    }
}

/// Rejected state change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    /// State at the time
    pub from: SessionState,
    /// Requested state
    pub to: SessionState,
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: SessionState,
    /// New state
    pub to: SessionState,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Session state machine
pub struct SessionStateMachine {
    state: SessionState,
    history: Vec<StateTransition>,
    max_history: usize,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStateMachine")
            .field("state", &self.state)
            .field("transitions", &self.history.len())
            .finish()
    }
}

impl SessionStateMachine {
    /// Create a new state machine
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            history: Vec::new(),
            max_history: 100,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get state history
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// States visited, in order, starting from the first `from`
    pub fn path(&self) -> Vec<SessionState> {
        path_of(&self.history)
    }

    /// Transition to a new state
    pub fn transition(
        &mut self,
        new_state: SessionState,
        reason: Option<&str>,
    ) -> Result<(), InvalidTransition> {
        if !self.is_valid_transition(new_state) {
            return Err(InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        self.history.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Local::now(),
            reason: reason.map(String::from),
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.state = new_state;
        Ok(())
    }

    /// Check if transition is valid
    fn is_valid_transition(&self, new_state: SessionState) -> bool {
        use SessionState::*;

        match (self.state, new_state) {
            (Idle, Connecting) => true,

            (Connecting, Provisioning) => true,
            (Connecting, Failed) => true,

            (Provisioning, Monitoring) => true,
            (Provisioning, Failed) => true,

            (Monitoring, Detected | TimedOut | Stopped | Failed) => true,

            // A finished session may be started again or reset
            (Detected | TimedOut | Stopped | Failed, Connecting | Idle) => true,

            _ => false,
        }
    }
}

/// States visited by `history`, in order, starting from the first `from`
pub fn path_of(history: &[StateTransition]) -> Vec<SessionState> {
    let mut path: Vec<SessionState> = history.first().map(|t| t.from).into_iter().collect();
    path.extend(history.iter().map(|t| t.to));
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = SessionStateMachine::new();
        assert_eq!(sm.state(), SessionState::Idle);

        sm.transition(SessionState::Connecting, Some("start")).unwrap();
        sm.transition(SessionState::Provisioning, None).unwrap();
        sm.transition(SessionState::Monitoring, None).unwrap();
        assert!(sm.state().is_active());
        sm.transition(SessionState::Detected, Some("SCIXB START")).unwrap();
        assert!(sm.state().is_terminal());

        assert_eq!(
            sm.path(),
            vec![
                SessionState::Idle,
                SessionState::Connecting,
                SessionState::Provisioning,
                SessionState::Monitoring,
                SessionState::Detected,
            ]
        );
        assert_eq!(sm.history()[3].reason.as_deref(), Some("SCIXB START"));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = SessionStateMachine::new();
        assert!(sm.transition(SessionState::Monitoring, None).is_err());

        sm.transition(SessionState::Connecting, None).unwrap();
        let err = sm.transition(SessionState::Detected, None).unwrap_err();
        assert_eq!(err.from, SessionState::Connecting);
        assert_eq!(err.to, SessionState::Detected);
        // Duplicate start while running
        assert!(sm.transition(SessionState::Connecting, None).is_err());
    }

    #[test]
    fn test_restart_after_terminal() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionState::Connecting, None).unwrap();
        sm.transition(SessionState::Failed, Some("refused")).unwrap();
        sm.transition(SessionState::Connecting, None).unwrap();
        assert_eq!(sm.state(), SessionState::Connecting);
        assert!(sm.transition(SessionState::Idle, None).is_err());
    }

    #[test]
    fn test_atomic_state_round_trips_every_state() {
        let published = AtomicSessionState::default();
        assert_eq!(published.load(), SessionState::Idle);
        for state in SessionState::ALL {
            published.store(state);
            assert_eq!(published.load(), state);
        }
    }
}
