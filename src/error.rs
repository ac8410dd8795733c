use thiserror::Error;

use crate::types::RunStatus;

/// Hard ceilings that end a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyLimit {
    #[error("plan exceeded {limit} steps")]
    PlanLength { limit: usize },

    #[error("reached maximum step executions ({limit})")]
    TotalExecutions { limit: u32 },

    #[error("step {step} failed after {limit} retries")]
    Retries { step: usize, limit: u32 },
}

/// Errors emitted by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Oracle plan output was empty or unparseable.
    #[error("planning failed: {0}")]
    Planning(String),

    /// A handler reported failure or the action could not be built.
    #[error("action failed: {0}")]
    Action(String),

    /// The oracle named an action the registry does not know.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// Transport failure or timeout talking to the oracle.
    #[error("oracle call failed: {0}")]
    Oracle(String),

    /// The oracle replied, but the reply could not be classified.
    #[error("unusable oracle output: {0}")]
    OracleProtocol(String),

    #[error("safety limit exceeded: {0}")]
    SafetyLimit(#[from] SafetyLimit),

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
}

impl EngineError {
    pub fn action(message: impl Into<String>) -> Self {
        Self::Action(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::OracleProtocol(message.into())
    }
}
