//! The engine's public write surface: enqueue a workflow run, send a
//! signal, cancel or resume an execution. Thin wrappers over `Store` plus
//! a delivery-row append — a shared handle wrapping `Store`/`Clock`
//! instead of config and an HTTP client.

use crate::events::EventBus;
use crate::ports::Clock;
use crate::store::Store;
use crate::types::{EventType, ExecutionStatus, Step, WorkflowEvent, WorkflowExecution};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Enqueue a new run of `steps` against `input`, returning its
    /// execution id. Appends an `execution.created` delivery so the
    /// dispatcher picks it up on its next poll.
    pub async fn enqueue_execution(
        &self,
        workflow_id: &str,
        steps: Vec<Step>,
        input: Value,
    ) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = self.clock.now_ms();

        self.store
            .put_execution(WorkflowExecution {
                id: id.clone(),
                workflow_id: workflow_id.to_string(),
                steps,
                input,
                status: ExecutionStatus::Enqueued,
                start_at_epoch_ms: now,
                deadline_at_epoch_ms: None,
                timeout_ms: None,
                completed_at_epoch_ms: None,
                output: None,
                error: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        self.store
            .append_event(WorkflowEvent {
                id: Uuid::new_v4().to_string(),
                execution_id: id.clone(),
                r#type: EventType::ExecutionCreated,
                name: None,
                payload: None,
                created_at: now,
                visible_at: Some(now),
                consumed_at: None,
                source_execution_id: None,
            })
            .await?;

        Ok(id)
    }

    /// Deliver a signal by name to a (presumably waiting) execution.
    pub async fn send_signal(
        &self,
        execution_id: &str,
        name: &str,
        payload: Option<Value>,
    ) -> anyhow::Result<()> {
        EventBus::new(self.store.clone(), self.clock.clone())
            .send_signal(execution_id, name, payload)
            .await
    }

    /// Cancel a running or enqueued execution. Returns `false` if it was
    /// already terminal.
    pub async fn cancel_execution(&self, execution_id: &str) -> anyhow::Result<bool> {
        self.store.cancel_execution(execution_id).await
    }

    /// Resume a cancelled execution, re-enqueuing it for dispatch. Returns
    /// `false` if it wasn't cancelled.
    pub async fn resume_execution(&self, execution_id: &str) -> anyhow::Result<bool> {
        let resumed = self.store.resume_execution(execution_id).await?;
        if resumed {
            let now = self.clock.now_ms();
            self.store
                .append_event(WorkflowEvent {
                    id: Uuid::new_v4().to_string(),
                    execution_id: execution_id.to_string(),
                    r#type: EventType::ExecutionCreated,
                    name: None,
                    payload: None,
                    created_at: now,
                    visible_at: Some(now),
                    consumed_at: None,
                    source_execution_id: None,
                })
                .await?;
        }
        Ok(resumed)
    }
}
