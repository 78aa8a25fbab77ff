//! Persistence contract: a typed façade over the execution/step-result/event
//! tables, with atomic conditional-update primitives as the concurrency
//! backbone (`claim_execution`, `claim_step`, `update_step`).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::types::{
    ExecutionFilter, ExecutionPage, ExecutionPatch, Page, StepResult, StepResultPatch,
    WorkflowEvent, WorkflowExecution,
};
use async_trait::async_trait;

/// Claiming a step either returns the (possibly freshly-claimed) row, or
/// reports why no claim was granted.
#[derive(Debug, Clone)]
pub enum StepClaim {
    /// This worker now owns the step; proceed to execute it.
    Claimed(StepResult),
    /// The step already completed — reuse its output verbatim.
    AlreadyComplete(StepResult),
    /// Another worker holds a live (non-stale) claim.
    Contended,
}

/// Persistence façade. Both the in-memory and Postgres implementations
/// honor the same atomic-predicate semantics described in the module docs.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_execution(&self, execution: WorkflowExecution) -> anyhow::Result<()>;

    /// Atomically transition `enqueued -> running`. Returns `None` if the
    /// execution doesn't exist or isn't `enqueued`.
    async fn claim_execution(&self, id: &str) -> anyhow::Result<Option<WorkflowExecution>>;

    async fn get_execution(&self, id: &str) -> anyhow::Result<Option<WorkflowExecution>>;

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        page: Page,
    ) -> anyhow::Result<ExecutionPage>;

    async fn update_execution(&self, id: &str, patch: ExecutionPatch) -> anyhow::Result<()>;

    /// Conditional on `status` being `enqueued` or `running`.
    async fn cancel_execution(&self, id: &str) -> anyhow::Result<bool>;

    /// Conditional on `status` being `cancelled`; resets to `enqueued` and
    /// clears `completed_at_epoch_ms`.
    async fn resume_execution(&self, id: &str) -> anyhow::Result<bool>;

    async fn get_step_results(&self, execution_id: &str) -> anyhow::Result<Vec<StepResult>>;

    async fn get_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> anyhow::Result<Option<StepResult>>;

    /// Idempotent upsert: claims the step unless it's already complete or
    /// held by a live (non-stale) claim.
    async fn claim_step(
        &self,
        execution_id: &str,
        step_id: &str,
        timeout_ms: u64,
    ) -> anyhow::Result<StepClaim>;

    /// Conditional update that never overwrites a row whose
    /// `completed_at_epoch_ms` is already set. Returns the row as it stands
    /// after the call (the patch if applied, the existing completed row
    /// otherwise).
    async fn update_step(
        &self,
        execution_id: &str,
        step_id: &str,
        patch: StepResultPatch,
    ) -> anyhow::Result<StepResult>;

    async fn append_event(&self, event: WorkflowEvent) -> anyhow::Result<()>;

    /// Events of one of `types`, not yet consumed, with `visible_at <= now`,
    /// ordered by `visible_at` ascending.
    async fn poll_due_events(
        &self,
        types: &[crate::types::EventType],
        now_ms: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<WorkflowEvent>>;

    /// Oldest unconsumed event matching `(execution_id, type, name)` with
    /// `visible_at <= now`.
    async fn find_event(
        &self,
        execution_id: &str,
        r#type: crate::types::EventType,
        name: &str,
        now_ms: i64,
    ) -> anyhow::Result<Option<WorkflowEvent>>;

    /// Conditional `consumed_at = now WHERE consumed_at IS NULL`. Returns
    /// `true` iff this call won the race.
    async fn consume_event(&self, event_id: &str, now_ms: i64) -> anyhow::Result<bool>;
}
