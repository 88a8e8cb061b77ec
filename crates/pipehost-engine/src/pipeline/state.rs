//! Supervisor lifecycle state machine

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::error::TransitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    UnTouched,
    Running,
    Provisioning,
    Failed,
    Terminated,
}

impl LifecycleState {
    pub fn is_final(&self) -> bool {
        matches!(self, LifecycleState::Failed | LifecycleState::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Startup,
    StartProvision,
    EndProvision,
    Error,
    TearedDown,
}

impl LifecycleState {
    /// Target state for `event`, or `None` when the transition is illegal
    pub fn next(self, event: LifecycleEvent) -> Option<LifecycleState> {
        use LifecycleEvent as E;
        use LifecycleState as S;

        match (self, event) {
            (S::UnTouched, E::Startup) => Some(S::Running),
            (S::Running, E::StartProvision) => Some(S::Provisioning),
            (S::Provisioning, E::EndProvision) => Some(S::Running),
            (S::Running, E::Error) | (S::Provisioning, E::Error) => Some(S::Failed),
            (S::Running, E::TearedDown) => Some(S::Terminated),
            _ => None,
        }
    }
}

/// Thread-safe holder of a [`LifecycleState`]
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: Mutex::new(LifecycleState::UnTouched),
        }
    }
}

impl Lifecycle {
    pub fn current(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply `event`, returning the new state
    pub fn fire(&self, event: LifecycleEvent) -> Result<LifecycleState, TransitionError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match state.next(event) {
            Some(next) => {
                *state = next;
                Ok(next)
            }
            None => Err(TransitionError {
                state: *state,
                event,
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.fire(LifecycleEvent::Startup).unwrap(), LifecycleState::Running);
        assert_eq!(
            lifecycle.fire(LifecycleEvent::StartProvision).unwrap(),
            LifecycleState::Provisioning
        );
        assert_eq!(lifecycle.fire(LifecycleEvent::EndProvision).unwrap(), LifecycleState::Running);
        assert_eq!(
            lifecycle.fire(LifecycleEvent::TearedDown).unwrap(),
            LifecycleState::Terminated
        );
    }

    #[test]
    fn test_error_while_provisioning_fails_run() {
        let lifecycle = Lifecycle::default();
        lifecycle.fire(LifecycleEvent::Startup).unwrap();
        lifecycle.fire(LifecycleEvent::StartProvision).unwrap();
        assert_eq!(lifecycle.fire(LifecycleEvent::Error).unwrap(), LifecycleState::Failed);
    }

    #[test]
    fn test_final_states_absorb_every_event() {
        let events = [
            LifecycleEvent::Startup,
            LifecycleEvent::StartProvision,
            LifecycleEvent::EndProvision,
            LifecycleEvent::Error,
            LifecycleEvent::TearedDown,
        ];
        for state in [LifecycleState::Failed, LifecycleState::Terminated] {
            assert!(state.is_final());
            for event in events {
                assert_eq!(state.next(event), None);
            }
        }
    }

    #[test]
    fn test_teardown_from_provisioning_is_rejected() {
        let lifecycle = Lifecycle::default();
        lifecycle.fire(LifecycleEvent::Startup).unwrap();
        lifecycle.fire(LifecycleEvent::StartProvision).unwrap();

        let err = lifecycle.fire(LifecycleEvent::TearedDown).unwrap_err();
        assert_eq!(err.state, LifecycleState::Provisioning);
        assert_eq!(lifecycle.current(), LifecycleState::Provisioning);
    }
}
