//! In-process `Store` implementation backed by mutex-guarded maps.
//!
//! Lets the engine and its test suite run without a live database — `PgStore`
//! always assumes Postgres; this is the fake/test-double counterpart, kept
//! in the same shape so it reads as a sibling rather than a foreign import.

use super::{Store, StepClaim};
use crate::types::{
    EventType, ExecutionFilter, ExecutionPage, ExecutionPatch, ExecutionStatus, Page, StepResult,
    StepResultPatch, WorkflowEvent, WorkflowExecution,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    executions: HashMap<String, WorkflowExecution>,
    step_results: HashMap<(String, String), StepResult>,
    events: HashMap<String, WorkflowEvent>,
}

/// An in-memory `Store`. Safe for concurrent access; not durable across
/// process restarts.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_execution(&self, execution: WorkflowExecution) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.executions.insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn claim_execution(&self, id: &str) -> anyhow::Result<Option<WorkflowExecution>> {
        let mut inner = self.inner.lock().await;
        match inner.executions.get_mut(id) {
            // `running` is re-claimable: a redelivery (signal resume, retry
            // backoff) re-examines an execution that never left `running`
            // while it waited. Only a terminal status rejects the claim.
            Some(exec)
                if matches!(exec.status, ExecutionStatus::Enqueued | ExecutionStatus::Running) =>
            {
                exec.status = ExecutionStatus::Running;
                Ok(Some(exec.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get_execution(&self, id: &str) -> anyhow::Result<Option<WorkflowExecution>> {
        let inner = self.inner.lock().await;
        Ok(inner.executions.get(id).cloned())
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        page: Page,
    ) -> anyhow::Result<ExecutionPage> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<&WorkflowExecution> = inner
            .executions
            .values()
            .filter(|e| {
                filter.workflow_id.as_ref().is_none_or(|w| *w == e.workflow_id)
                    && filter.status.is_none_or(|s| s == e.status)
            })
            .collect();
        matching.sort_by_key(|e| e.created_at);
        let total_count = matching.len();
        let items = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok(ExecutionPage { items, total_count })
    }

    async fn update_execution(&self, id: &str, patch: ExecutionPatch) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(exec) = inner.executions.get_mut(id) {
            if let Some(status) = patch.status {
                exec.status = status;
            }
            if patch.output.is_some() {
                exec.output = patch.output;
            }
            if patch.error.is_some() {
                exec.error = patch.error;
            }
            if patch.completed_at_epoch_ms.is_some() {
                exec.completed_at_epoch_ms = patch.completed_at_epoch_ms;
            }
        }
        Ok(())
    }

    async fn cancel_execution(&self, id: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.executions.get_mut(id) {
            Some(exec)
                if matches!(exec.status, ExecutionStatus::Enqueued | ExecutionStatus::Running) =>
            {
                exec.status = ExecutionStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resume_execution(&self, id: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.executions.get_mut(id) {
            Some(exec) if exec.status == ExecutionStatus::Cancelled => {
                exec.status = ExecutionStatus::Enqueued;
                exec.completed_at_epoch_ms = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_step_results(&self, execution_id: &str) -> anyhow::Result<Vec<StepResult>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .step_results
            .values()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn get_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> anyhow::Result<Option<StepResult>> {
        let inner = self.inner.lock().await;
        Ok(inner.step_results.get(&(execution_id.to_string(), step_id.to_string())).cloned())
    }

    async fn claim_step(
        &self,
        execution_id: &str,
        step_id: &str,
        timeout_ms: u64,
    ) -> anyhow::Result<StepClaim> {
        let mut inner = self.inner.lock().await;
        let key = (execution_id.to_string(), step_id.to_string());
        let now = now_ms();

        match inner.step_results.get(&key) {
            None => {
                let row = StepResult {
                    execution_id: execution_id.to_string(),
                    step_id: step_id.to_string(),
                    started_at_epoch_ms: now,
                    completed_at_epoch_ms: None,
                    output: None,
                    error: None,
                };
                inner.step_results.insert(key, row.clone());
                Ok(StepClaim::Claimed(row))
            }
            Some(existing) if existing.is_complete() => {
                Ok(StepClaim::AlreadyComplete(existing.clone()))
            }
            Some(existing) if now - existing.started_at_epoch_ms > timeout_ms as i64 => {
                let row = StepResult {
                    execution_id: execution_id.to_string(),
                    step_id: step_id.to_string(),
                    started_at_epoch_ms: now,
                    completed_at_epoch_ms: None,
                    output: None,
                    error: None,
                };
                inner.step_results.insert(key, row.clone());
                Ok(StepClaim::Claimed(row))
            }
            Some(_) => Ok(StepClaim::Contended),
        }
    }

    async fn update_step(
        &self,
        execution_id: &str,
        step_id: &str,
        patch: StepResultPatch,
    ) -> anyhow::Result<StepResult> {
        let mut inner = self.inner.lock().await;
        let key = (execution_id.to_string(), step_id.to_string());
        let existing = inner.step_results.get(&key).cloned().ok_or_else(|| {
            anyhow::anyhow!("update_step on unclaimed step {execution_id}/{step_id}")
        })?;

        if existing.is_complete() {
            return Ok(existing);
        }

        let mut updated = existing;
        if patch.completed_at_epoch_ms.is_some() {
            updated.completed_at_epoch_ms = patch.completed_at_epoch_ms;
        }
        if patch.output.is_some() {
            updated.output = patch.output;
        }
        if patch.error.is_some() {
            updated.error = patch.error;
        }
        inner.step_results.insert(key, updated.clone());
        Ok(updated)
    }

    async fn append_event(&self, event: WorkflowEvent) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.events.insert(event.id.clone(), event);
        Ok(())
    }

    async fn poll_due_events(
        &self,
        types: &[EventType],
        now_ms: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<WorkflowEvent>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<WorkflowEvent> = inner
            .events
            .values()
            .filter(|e| {
                types.contains(&e.r#type)
                    && e.consumed_at.is_none()
                    && e.visible_at.is_none_or(|v| v <= now_ms)
            })
            .cloned()
            .collect();
        due.sort_by_key(|e| e.visible_at.unwrap_or(e.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn find_event(
        &self,
        execution_id: &str,
        r#type: EventType,
        name: &str,
        now_ms: i64,
    ) -> anyhow::Result<Option<WorkflowEvent>> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<&WorkflowEvent> = inner
            .events
            .values()
            .filter(|e| {
                e.execution_id == execution_id
                    && e.r#type == r#type
                    && e.name.as_deref() == Some(name)
                    && e.consumed_at.is_none()
                    && e.visible_at.is_none_or(|v| v <= now_ms)
            })
            .collect();
        matching.sort_by_key(|e| e.created_at);
        Ok(matching.into_iter().next().cloned())
    }

    async fn consume_event(&self, event_id: &str, now_ms: i64) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.events.get_mut(event_id) {
            Some(event) if event.consumed_at.is_none() => {
                event.consumed_at = Some(now_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
