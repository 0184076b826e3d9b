//! Lifecycle of one invocation as an explicit state machine.
//!
//! `transition` is pure: the engine and the plan executor feed it signals as
//! they observe outcomes, and never set the state directly.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state")]
pub enum EngineState {
    Idle,
    Verifying,
    Routing,
    Planning,
    /// Running step `step` (0-based) of a plan with `of` steps.
    Executing { step: usize, of: usize },
    Completed,
    Aborted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "Idle"),
            EngineState::Verifying => write!(f, "Verifying"),
            EngineState::Routing => write!(f, "Routing"),
            EngineState::Planning => write!(f, "Planning"),
            EngineState::Executing { step, .. } => write!(f, "Executing({})", step),
            EngineState::Completed => write!(f, "Completed"),
            EngineState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Observations that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    RequestReceived,
    SignatureValid,
    SignatureInvalid,
    /// Out of scope, or claims to be in scope but is unusable.
    EventIgnored,
    EventRecognized,
    PlanBuilt { steps: usize },
    /// Current step was Applied or AlreadySatisfied.
    StepResolved,
    /// Current step failed permanently.
    StepFailed,
    /// The invocation deadline passed.
    DeadlineExceeded,
}

/// Pure state transition function.
///
/// Signals that make no sense in the current state leave it unchanged;
/// terminal states absorb everything.
pub fn transition(state: EngineState, signal: Signal) -> EngineState {
    use EngineState::*;

    match (state, signal) {
        (Idle, Signal::RequestReceived) => Verifying,

        (Verifying, Signal::SignatureInvalid) => Aborted,
        (Verifying, Signal::SignatureValid) => Routing,

        (Routing, Signal::EventIgnored) => Completed,
        (Routing, Signal::EventRecognized) => Planning,

        (Planning, Signal::PlanBuilt { steps: 0 }) => Completed,
        (Planning, Signal::PlanBuilt { steps }) => Executing { step: 0, of: steps },

        (Executing { step, of }, Signal::StepResolved) if step + 1 >= of => Completed,
        (Executing { step, of }, Signal::StepResolved) => Executing { step: step + 1, of },
        (Executing { .. }, Signal::StepFailed) => Aborted,

        (Completed | Aborted, _) => state,
        (_, Signal::DeadlineExceeded) => Aborted,

        _ => state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(signals: &[Signal]) -> EngineState {
        signals
            .iter()
            .fold(EngineState::Idle, |state, signal| transition(state, *signal))
    }

    #[test]
    fn test_happy_path_walks_every_step() {
        let mut state = run(&[
            Signal::RequestReceived,
            Signal::SignatureValid,
            Signal::EventRecognized,
            Signal::PlanBuilt { steps: 3 },
        ]);
        assert_eq!(state, EngineState::Executing { step: 0, of: 3 });

        state = transition(state, Signal::StepResolved);
        assert_eq!(state, EngineState::Executing { step: 1, of: 3 });
        state = transition(state, Signal::StepResolved);
        state = transition(state, Signal::StepResolved);
        assert_eq!(state, EngineState::Completed);
    }

    #[test]
    fn test_invalid_signature_aborts() {
        let state = run(&[Signal::RequestReceived, Signal::SignatureInvalid]);
        assert_eq!(state, EngineState::Aborted);
    }

    #[test]
    fn test_ignored_events_complete_without_planning() {
        let state = run(&[
            Signal::RequestReceived,
            Signal::SignatureValid,
            Signal::EventIgnored,
        ]);
        assert_eq!(state, EngineState::Completed);
    }

    #[test]
    fn test_step_failure_aborts_mid_plan() {
        let state = run(&[
            Signal::RequestReceived,
            Signal::SignatureValid,
            Signal::EventRecognized,
            Signal::PlanBuilt { steps: 6 },
            Signal::StepResolved,
            Signal::StepFailed,
        ]);
        assert_eq!(state, EngineState::Aborted);
    }

    #[test]
    fn test_deadline_aborts_executing_plan() {
        let state = transition(EngineState::Executing { step: 2, of: 6 }, Signal::DeadlineExceeded);
        assert_eq!(state, EngineState::Aborted);
    }

    #[test]
    fn test_terminal_states_absorb_signals() {
        for signal in [
            Signal::RequestReceived,
            Signal::SignatureValid,
            Signal::StepResolved,
            Signal::DeadlineExceeded,
        ] {
            assert_eq!(transition(EngineState::Completed, signal), EngineState::Completed);
            assert_eq!(transition(EngineState::Aborted, signal), EngineState::Aborted);
        }
    }

    #[test]
    fn test_out_of_order_signals_are_ignored() {
        assert_eq!(transition(EngineState::Idle, Signal::StepResolved), EngineState::Idle);
        assert_eq!(
            transition(EngineState::Routing, Signal::SignatureValid),
            EngineState::Routing
        );
    }

    #[test]
    fn test_empty_plan_completes_immediately() {
        assert_eq!(
            transition(EngineState::Planning, Signal::PlanBuilt { steps: 0 }),
            EngineState::Completed
        );
    }
}
