//! Typed error taxonomy.
//!
//! The Executor pattern-matches these outcomes to decide whether an
//! execution terminates, pauses, or gets rescheduled. Port implementations
//! and process glue use `anyhow::Result` instead — only the decisions the
//! orchestrator itself needs to branch on are typed here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("execution {execution_id} cancelled")]
    WorkflowCancelled { execution_id: String },

    #[error("step {step} waiting for signal {signal}")]
    WaitingForSignal {
        execution_id: String,
        step: String,
        signal: String,
        timeout_ms: Option<u64>,
        wait_started_at: i64,
    },

    #[error("step {step} waiting for timer")]
    WaitingForTimer { execution_id: String, step: String },

    #[error("step {step} claim contended on execution {execution_id}")]
    StuckStep { execution_id: String, step: String },

    #[error("step {step} failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("tool error: {0}")]
    Tool(String),

    #[error("code error: {0}")]
    Code(String),
}
