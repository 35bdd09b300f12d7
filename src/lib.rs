pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod lock;
pub mod logger;
pub mod orchestrator;
pub mod session;
pub mod stage;
pub mod supervisor;
pub mod telemetry;

pub use errors::{LockError, LoggerError, OrchestratorError};
pub use orchestrator::{Orchestrator, OrchestratorConfig, SessionReport};
