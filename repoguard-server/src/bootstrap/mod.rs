//! Bootstrap orchestration: the invocation state machine, the plan executor,
//! and a read-only preview of what a plan would do.

pub mod executor;
pub mod preview;
pub mod state;

pub use executor::{execute_plan, PlanContext, PlanOutcome, DEADLINE_EXCEEDED};
pub use preview::{preview_plan, PreviewEntry};
pub use state::{transition, EngineState, Signal};
