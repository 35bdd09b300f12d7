use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;

/// Where a launch session is in its lifecycle.
///
/// ```text
/// Idle -> LockAcquired -> Attempting(0) -> Attempting(1) -> ... -> Success | Exhausted -> Done
///   \___________\______________\__________________________________-> Interrupted -> Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage_index", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    LockAcquired,
    /// Zero-based index into the (truncated) stage list.
    Attempting(usize),
    Success,
    Exhausted,
    Interrupted,
    Done,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done)
    }

    fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (Idle, LockAcquired) => true,
            (LockAcquired, Attempting(0)) => true,
            (Attempting(i), Attempting(j)) => j == i + 1,
            (Attempting(_), Success | Exhausted) => true,
            (Idle | LockAcquired | Attempting(_), Interrupted) => true,
            (Success | Exhausted | Interrupted, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::LockAcquired => write!(f, "lock_acquired"),
            RunState::Attempting(i) => write!(f, "attempting({})", i),
            RunState::Success => write!(f, "success"),
            RunState::Exhausted => write!(f, "exhausted"),
            RunState::Interrupted => write!(f, "interrupted"),
            RunState::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
}

/// Validated run state with its transition history.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: RunState,
    history: Vec<Transition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Idle,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Move to `to`, or fail without changing state if the edge is not allowed.
    pub fn transition(&mut self, to: RunState) -> Result<(), OrchestratorError> {
        if !self.current.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }
        self.history.push(Transition {
            from: self.current,
            to,
            at: Utc::now(),
        });
        self.current = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(states: &[RunState]) -> StateMachine {
        let mut sm = StateMachine::new();
        for &s in states {
            sm.transition(s).unwrap();
        }
        sm
    }

    #[test]
    fn test_success_path() {
        let sm = drive(&[
            RunState::LockAcquired,
            RunState::Attempting(0),
            RunState::Attempting(1),
            RunState::Success,
            RunState::Done,
        ]);
        assert_eq!(sm.current(), RunState::Done);
        assert!(sm.current().is_terminal());
        assert_eq!(sm.history().len(), 5);
        assert_eq!(sm.history()[0].from, RunState::Idle);
    }

    #[test]
    fn test_exhausted_path() {
        let sm = drive(&[
            RunState::LockAcquired,
            RunState::Attempting(0),
            RunState::Exhausted,
            RunState::Done,
        ]);
        assert_eq!(sm.history()[2].to, RunState::Exhausted);
    }

    #[test]
    fn test_interrupt_from_any_live_state() {
        for prefix in [
            vec![],
            vec![RunState::LockAcquired],
            vec![RunState::LockAcquired, RunState::Attempting(0)],
        ] {
            let mut sm = drive(&prefix);
            sm.transition(RunState::Interrupted).unwrap();
            sm.transition(RunState::Done).unwrap();
        }
    }

    #[test]
    fn test_attempts_cannot_skip_stages() {
        let mut sm = drive(&[RunState::LockAcquired, RunState::Attempting(0)]);
        let err = sm.transition(RunState::Attempting(2)).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(sm.current(), RunState::Attempting(0));
    }

    #[test]
    fn test_invalid_edges() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(RunState::Attempting(0)).is_err());
        assert!(sm.transition(RunState::Success).is_err());
        assert!(sm.transition(RunState::Done).is_err());

        let mut sm = drive(&[
            RunState::LockAcquired,
            RunState::Attempting(0),
            RunState::Success,
        ]);
        assert!(sm.transition(RunState::Interrupted).is_err());
        assert!(sm.transition(RunState::Attempting(1)).is_err());

        let mut sm = drive(&[RunState::LockAcquired]);
        assert!(sm.transition(RunState::Attempting(1)).is_err());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&RunState::Attempting(3)).unwrap();
        assert_eq!(json, r#"{"state":"attempting","stage_index":3}"#);
        let json = serde_json::to_string(&RunState::Done).unwrap();
        assert_eq!(json, r#"{"state":"done"}"#);
    }
}
