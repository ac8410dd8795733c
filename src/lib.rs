//! Autonomous task-execution engine.
//!
//! A task goes through the [`planner`], each step through the [`resolver`] and the
//! [`actions`] registry, all driven by the state machine in [`runner`]. The
//! [`interactive`] variant lets the oracle pause and ask the user. Long-running
//! subprocesses are owned by [`process`].
//!
//! The oracle (a language model) and the browser are traits; the `agent` binary
//! supplies real implementations.

pub mod actions;
pub mod config;
pub mod error;
pub mod interactive;
pub mod logging;
pub mod oracle;
pub mod planner;
pub mod process;
pub mod prompts;
pub mod reporter;
pub mod resolver;
pub mod runner;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use actions::{Action, ActionName, ActionRegistry, PageDriver};
pub use config::EngineConfig;
pub use error::{EngineError, SafetyLimit};
pub use interactive::{InteractiveRunner, OracleResponse, SessionStatus, SessionStore};
pub use oracle::{ChatMessage, DecisionOracle, OracleReply};
pub use process::{ProcessManager, ProcessManagerConfig, ProcessSnapshot, ProcessStatus};
pub use reporter::{ProgressEvent, ProgressReporter};
pub use runner::TaskRunner;
pub use types::{ActionResult, RunResult, RunStatus, StepKind, TaskPlan, TaskStep};
