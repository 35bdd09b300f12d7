//! Progressive launch orchestration.
//!
//! - `state` - the validated run state machine
//! - `runner` - [`Orchestrator`], which drives lock, stages, supervisor,
//!   diagnostics and the forensic record through one session

pub mod runner;
pub mod state;

pub use runner::{Orchestrator, OrchestratorConfig, SessionReport, build_args};
pub use state::{RunState, StateMachine, Transition};
