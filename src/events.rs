//! Signal and timer subsystem, layered on top of the `Store`'s durable
//! event log. Also the home of the dispatcher's own delivery queue:
//! `execution.created`/`execution.retry` are just another event type in
//! the same table, polled via `visible_at <= now`.

use crate::errors::EngineError;
use crate::ports::Clock;
use crate::store::Store;
use crate::types::{EventType, StepResult, StepResultPatch, WorkflowEvent};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

pub struct EventBus {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append a signal delivery and wake the execution for re-examination.
    pub async fn send_signal(
        &self,
        execution_id: &str,
        name: &str,
        payload: Option<Value>,
    ) -> anyhow::Result<()> {
        let now = self.clock.now_ms();
        self.store
            .append_event(WorkflowEvent {
                id: Uuid::new_v4().to_string(),
                execution_id: execution_id.to_string(),
                r#type: EventType::Signal,
                name: Some(name.to_string()),
                payload,
                created_at: now,
                visible_at: Some(now),
                consumed_at: None,
                source_execution_id: None,
            })
            .await?;
        self.schedule_retry(execution_id, 0).await
    }

    /// Publish an `execution.retry` delivery, due `delay_ms` from now.
    pub async fn schedule_retry(&self, execution_id: &str, delay_ms: i64) -> anyhow::Result<()> {
        let now = self.clock.now_ms();
        self.store
            .append_event(WorkflowEvent {
                id: Uuid::new_v4().to_string(),
                execution_id: execution_id.to_string(),
                r#type: EventType::ExecutionRetry,
                name: None,
                payload: None,
                created_at: now,
                visible_at: Some(now + delay_ms),
                consumed_at: None,
                source_execution_id: None,
            })
            .await
    }

    /// Schedule a future wake-up: appends both a durable `timer` event (for
    /// `await_timer`) and an `execution.retry` delivery so the dispatcher
    /// re-examines the execution no earlier than `wake_at_epoch_ms`.
    pub async fn schedule_timer(
        &self,
        execution_id: &str,
        step_name: &str,
        wake_at_epoch_ms: i64,
    ) -> anyhow::Result<()> {
        let now = self.clock.now_ms();
        self.store
            .append_event(WorkflowEvent {
                id: Uuid::new_v4().to_string(),
                execution_id: execution_id.to_string(),
                r#type: EventType::Timer,
                name: Some(step_name.to_string()),
                payload: None,
                created_at: now,
                visible_at: Some(wake_at_epoch_ms),
                consumed_at: None,
                source_execution_id: None,
            })
            .await?;
        self.store
            .append_event(WorkflowEvent {
                id: Uuid::new_v4().to_string(),
                execution_id: execution_id.to_string(),
                r#type: EventType::ExecutionRetry,
                name: None,
                payload: None,
                created_at: now,
                visible_at: Some(wake_at_epoch_ms),
                consumed_at: None,
                source_execution_id: None,
            })
            .await
    }

    /// Consume a due timer event for `step_name`, or report it's not due
    /// yet.
    pub async fn await_timer(
        &self,
        execution_id: &str,
        step_name: &str,
    ) -> Result<(), EngineError> {
        let now = self.clock.now_ms();
        let found = self
            .store
            .find_event(execution_id, EventType::Timer, step_name, now)
            .await
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        match found {
            Some(event) => {
                let consumed = self
                    .store
                    .consume_event(&event.id, now)
                    .await
                    .map_err(|e| EngineError::Validation(e.to_string()))?;
                if consumed {
                    Ok(())
                } else {
                    Err(EngineError::WaitingForTimer {
                        execution_id: execution_id.to_string(),
                        step: step_name.to_string(),
                    })
                }
            }
            None => Err(EngineError::WaitingForTimer {
                execution_id: execution_id.to_string(),
                step: step_name.to_string(),
            }),
        }
    }

    /// Poll the oldest matching signal and consume it, resuming a `Signal`
    /// step. Ensures the step's `StepResult` row exists (a signal wait's
    /// checkpoint) the first time it's reached.
    pub async fn await_signal(
        &self,
        execution_id: &str,
        step_name: &str,
        signal_name: &str,
        timeout_ms: Option<u64>,
    ) -> Result<StepResult, EngineError> {
        let wait_row = self.ensure_wait_row(execution_id, step_name).await?;
        if wait_row.is_complete() {
            return Ok(wait_row);
        }
        let wait_started_at = wait_row.started_at_epoch_ms;

        let now = self.clock.now_ms();
        if let Some(resolved) = self.try_consume_signal(execution_id, step_name, signal_name, now).await? {
            return Ok(resolved);
        }

        if let Some(timeout_ms) = timeout_ms {
            if now - wait_started_at > timeout_ms as i64 {
                let row = self
                    .store
                    .update_step(
                        execution_id,
                        step_name,
                        StepResultPatch {
                            completed_at_epoch_ms: None,
                            output: None,
                            error: Some(serde_json::json!({ "message": "signal timeout" })),
                        },
                    )
                    .await
                    .map_err(|e| EngineError::Validation(e.to_string()))?;
                let _ = row;
                return Err(EngineError::StepFailed {
                    step: step_name.to_string(),
                    message: "signal timeout".to_string(),
                });
            }
        }

        Err(EngineError::WaitingForSignal {
            execution_id: execution_id.to_string(),
            step: step_name.to_string(),
            signal: signal_name.to_string(),
            timeout_ms,
            wait_started_at,
        })
    }

    /// Look for a due, unconsumed signal event once. A lost race on
    /// `consume_event` is retried exactly once within the same call.
    async fn try_consume_signal(
        &self,
        execution_id: &str,
        step_name: &str,
        signal_name: &str,
        now: i64,
    ) -> Result<Option<StepResult>, EngineError> {
        for _ in 0..2 {
            let found = self
                .store
                .find_event(execution_id, EventType::Signal, signal_name, now)
                .await
                .map_err(|e| EngineError::Validation(e.to_string()))?;

            let Some(event) = found else { return Ok(None) };

            let consumed = self
                .store
                .consume_event(&event.id, now)
                .await
                .map_err(|e| EngineError::Validation(e.to_string()))?;

            if consumed {
                let row = self
                    .store
                    .update_step(
                        execution_id,
                        step_name,
                        StepResultPatch {
                            completed_at_epoch_ms: Some(now),
                            output: Some(event.payload.unwrap_or(Value::Null)),
                            error: None,
                        },
                    )
                    .await
                    .map_err(|e| EngineError::Validation(e.to_string()))?;
                return Ok(Some(row));
            }
            // lost the race — loop once more to try the next oldest event
        }
        Ok(None)
    }

    /// Idempotently ensure the signal step has a checkpoint row, returning
    /// it (possibly already complete, from a prior resumption).
    async fn ensure_wait_row(
        &self,
        execution_id: &str,
        step_name: &str,
    ) -> Result<StepResult, EngineError> {
        if let Some(existing) = self
            .store
            .get_step_result(execution_id, step_name)
            .await
            .map_err(|e| EngineError::Validation(e.to_string()))?
        {
            return Ok(existing);
        }

        match self
            .store
            .claim_step(execution_id, step_name, u64::MAX)
            .await
            .map_err(|e| EngineError::Validation(e.to_string()))?
        {
            crate::store::StepClaim::Claimed(row) => Ok(row),
            crate::store::StepClaim::AlreadyComplete(row) => Ok(row),
            crate::store::StepClaim::Contended => self
                .store
                .get_step_result(execution_id, step_name)
                .await
                .map_err(|e| EngineError::Validation(e.to_string()))?
                .ok_or_else(|| EngineError::Validation("signal step claim race".to_string())),
        }
    }
}
