//! Per-step lifecycle: cancellation gate, claim, retry with backoff,
//! per-attempt timeout, dispatch by action kind, and persistence of the
//! outcome.

use crate::errors::EngineError;
use crate::events::EventBus;
use crate::ports::{Clock, CodeRunner, ToolInvoker};
use crate::store::{StepClaim, Store};
use crate::types::{Action, Step, StepResult, StepResultPatch};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The outcome of a single attempt at running a step's body (excluding the
/// claim/persist machinery around it).
enum Attempt {
    Ok(Value),
    Failed(String),
    /// Cancellation or a signal/timer pause — must not be retried, must
    /// propagate immediately.
    Paused(EngineError),
}

pub struct StepExecutor {
    store: Arc<dyn Store>,
    tool_invoker: Arc<dyn ToolInvoker>,
    code_runner: Option<Arc<dyn CodeRunner>>,
    clock: Arc<dyn Clock>,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        tool_invoker: Arc<dyn ToolInvoker>,
        code_runner: Option<Arc<dyn CodeRunner>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, tool_invoker, code_runner, clock }
    }

    /// Run one step to completion (or a terminal failure / pause),
    /// persisting the outcome along the way.
    pub async fn execute_step(
        &self,
        execution_id: &str,
        step: &Step,
        resolved_input: Value,
    ) -> Result<StepResult, EngineError> {
        self.cancellation_gate(execution_id).await?;

        if let Action::Signal { signal_name, timeout_ms } = &step.action {
            let bus = EventBus::new(self.store.clone(), self.clock.clone());
            return bus.await_signal(execution_id, &step.name, signal_name, *timeout_ms).await;
        }

        let claim = self
            .store
            .claim_step(execution_id, &step.name, step.config.timeout_ms())
            .await
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        let claimed = match claim {
            StepClaim::AlreadyComplete(row) => return Ok(row),
            StepClaim::Contended => {
                return Err(EngineError::StuckStep {
                    execution_id: execution_id.to_string(),
                    step: step.name.clone(),
                });
            }
            StepClaim::Claimed(row) => row,
        };

        let max_attempts = step.config.max_attempts();
        let backoff_ms = step.config.backoff_ms();
        let timeout_ms = step.config.timeout_ms();

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.cancellation_gate(execution_id).await?;
                let wait = backoff_ms * 2u64.pow(attempt - 2);
                if wait > 0 {
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
            }

            let outcome = self.run_attempt(step, resolved_input.clone(), timeout_ms).await;

            match outcome {
                Attempt::Ok(output) => {
                    let updated = self
                        .store
                        .update_step(
                            execution_id,
                            &step.name,
                            StepResultPatch {
                                completed_at_epoch_ms: Some(self.clock.now_ms()),
                                output: Some(output),
                                error: None,
                            },
                        )
                        .await
                        .map_err(|e| EngineError::Validation(e.to_string()))?;
                    return Ok(updated);
                }
                Attempt::Paused(err) => return Err(err),
                Attempt::Failed(message) => {
                    last_error = message;
                    warn!(
                        step = %step.name,
                        attempt,
                        max_attempts,
                        "step attempt failed: {}",
                        last_error
                    );
                }
            }
        }

        self.store
            .update_step(
                execution_id,
                &step.name,
                StepResultPatch {
                    completed_at_epoch_ms: None,
                    output: None,
                    error: Some(serde_json::json!({ "message": last_error.clone() })),
                },
            )
            .await
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        let _ = claimed; // claim row already reflects the final state via update_step
        Err(EngineError::StepFailed { step: step.name.clone(), message: last_error })
    }

    async fn cancellation_gate(&self, execution_id: &str) -> Result<(), EngineError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await
            .map_err(|e| EngineError::Validation(e.to_string()))?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        if execution.status == crate::types::ExecutionStatus::Cancelled {
            return Err(EngineError::WorkflowCancelled { execution_id: execution_id.to_string() });
        }
        Ok(())
    }

    async fn run_attempt(&self, step: &Step, input: Value, timeout_ms: u64) -> Attempt {
        let body = self.dispatch(step, input);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), body).await {
            Ok(Attempt::Ok(v)) => Attempt::Ok(v),
            Ok(Attempt::Failed(m)) => Attempt::Failed(m),
            Ok(Attempt::Paused(e)) => Attempt::Paused(e),
            Err(_) => Attempt::Failed(format!("timed out after {timeout_ms}ms")),
        }
    }

    async fn dispatch(&self, step: &Step, input: Value) -> Attempt {
        match &step.action {
            Action::Tool { connection_id, tool_name } => {
                info!(step = %step.name, connection_id, tool_name, "invoking tool");
                match self
                    .tool_invoker
                    .invoke(connection_id, tool_name, input, step.config.timeout_ms())
                    .await
                {
                    Ok(v) => Attempt::Ok(v),
                    Err(e) => Attempt::Failed(e.to_string()),
                }
            }
            Action::Code { source } => match &self.code_runner {
                Some(runner) => {
                    match runner
                        .run(source, input, &step.name, step.config.timeout_ms())
                        .await
                    {
                        Ok(v) => Attempt::Ok(v),
                        Err(e) => Attempt::Failed(e.to_string()),
                    }
                }
                None => Attempt::Failed("no CodeRunner configured".to_string()),
            },
            Action::Signal { .. } => {
                // Handled before the claim/retry loop; unreachable here.
                Attempt::Paused(EngineError::Validation(
                    "signal steps do not go through the retry loop".to_string(),
                ))
            }
        }
    }
}
