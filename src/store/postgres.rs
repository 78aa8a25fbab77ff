//! PostgreSQL-backed `Store`.
//!
//! Same migration-on-connect and upsert idiom as a unified execution
//! contract store, generalized with the conditional WHERE predicates the
//! claim/update primitives require: a plain
//! `ON CONFLICT DO UPDATE` always overwrites, which can't express "only
//! claim if nobody else holds a live lease" or "never overwrite a
//! completed row."

use super::{StepClaim, Store};
use crate::types::{
    EventType, ExecutionFilter, ExecutionPage, ExecutionPatch, ExecutionStatus, Page, Step,
    StepResult, StepResultPatch, WorkflowEvent, WorkflowExecution,
};
use async_trait::async_trait;
use serde_json::Value;

pub struct PgStore {
    pool: sqlx::PgPool,
}

impl PgStore {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables if they don't exist. Safe to call from multiple
    /// processes racing to start up.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                id                   TEXT PRIMARY KEY,
                workflow_id          TEXT NOT NULL,
                steps                JSONB NOT NULL,
                status               TEXT NOT NULL CHECK (status IN
                    ('enqueued','running','success','error','cancelled')),
                input                JSONB NOT NULL DEFAULT '{}',
                output               JSONB,
                error                JSONB,
                created_at           BIGINT NOT NULL,
                updated_at           BIGINT NOT NULL,
                start_at_epoch_ms    BIGINT NOT NULL,
                completed_at_epoch_ms BIGINT,
                timeout_ms           BIGINT,
                deadline_at_epoch_ms BIGINT
            );

            CREATE TABLE IF NOT EXISTS execution_step_results (
                execution_id         TEXT NOT NULL REFERENCES workflow_executions(id),
                step_id              TEXT NOT NULL,
                started_at_epoch_ms  BIGINT NOT NULL,
                completed_at_epoch_ms BIGINT,
                output               JSONB,
                error                JSONB,
                PRIMARY KEY (execution_id, step_id)
            );

            CREATE TABLE IF NOT EXISTS workflow_events (
                id                   TEXT PRIMARY KEY,
                execution_id         TEXT NOT NULL REFERENCES workflow_executions(id),
                type                 TEXT NOT NULL CHECK (type IN
                    ('signal','timer','message','output','step_started','step_completed',
                     'workflow_started','workflow_completed','execution.created','execution.retry')),
                name                 TEXT,
                payload              JSONB,
                created_at           BIGINT NOT NULL,
                visible_at           BIGINT,
                consumed_at          BIGINT,
                source_execution_id  TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_workflow_events_output
                ON workflow_events(execution_id, name) WHERE type = 'output';
            CREATE INDEX IF NOT EXISTS idx_workflow_events_pending
                ON workflow_events(type, visible_at) WHERE consumed_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_step_results_execution
                ON execution_step_results(execution_id);
            CREATE INDEX IF NOT EXISTS idx_workflow_executions_status
                ON workflow_executions(status);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn put_execution(&self, execution: WorkflowExecution) -> anyhow::Result<()> {
        let steps = serde_json::to_value(&execution.steps)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, workflow_id, steps, status, input, output, error,
                 created_at, updated_at, start_at_epoch_ms, completed_at_epoch_ms,
                 timeout_ms, deadline_at_epoch_ms)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(steps)
        .bind(execution.status.to_string())
        .bind(&execution.input)
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.start_at_epoch_ms)
        .bind(execution.completed_at_epoch_ms)
        .bind(execution.timeout_ms)
        .bind(execution.deadline_at_epoch_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_execution(&self, id: &str) -> anyhow::Result<Option<WorkflowExecution>> {
        // `running` is re-claimable: a redelivery (signal resume, retry
        // backoff) re-examines an execution that never left `running` while
        // it waited. Only a terminal status rejects the claim.
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            UPDATE workflow_executions
            SET status = 'running', updated_at = $2
            WHERE id = $1 AND status IN ('enqueued', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_execution(&self, id: &str) -> anyhow::Result<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM workflow_executions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        page: Page,
    ) -> anyhow::Result<ExecutionPage> {
        // Simple, readable predicate composition over two optional filters
        // rather than a query builder — plain `sqlx::query` strings over
        // an abstraction layer.
        let status_str = filter.status.map(|s| s.to_string());

        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM workflow_executions
            WHERE ($1::text IS NULL OR workflow_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at ASC
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(&filter.workflow_id)
        .bind(&status_str)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        // Open question (SPEC_FULL.md §9): total_count is a full COUNT(*)
        // under the same WHERE clause, not the page length.
        let total_count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM workflow_executions
            WHERE ($1::text IS NULL OR workflow_id = $1)
              AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(&filter.workflow_id)
        .bind(&status_str)
        .fetch_one(&self.pool)
        .await?;

        Ok(ExecutionPage {
            items: rows.into_iter().map(Into::into).collect(),
            total_count: total_count as usize,
        })
    }

    async fn update_execution(&self, id: &str, patch: ExecutionPatch) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = COALESCE($2, status),
                output = COALESCE($3, output),
                error = COALESCE($4, error),
                completed_at_epoch_ms = COALESCE($5, completed_at_epoch_ms),
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.to_string()))
        .bind(&patch.output)
        .bind(&patch.error)
        .bind(patch.completed_at_epoch_ms)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_execution(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'cancelled', updated_at = $2
            WHERE id = $1 AND status IN ('enqueued', 'running')
            "#,
        )
        .bind(id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn resume_execution(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'enqueued', completed_at_epoch_ms = NULL, updated_at = $2
            WHERE id = $1 AND status = 'cancelled'
            "#,
        )
        .bind(id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_step_results(&self, execution_id: &str) -> anyhow::Result<Vec<StepResult>> {
        let rows = sqlx::query_as::<_, StepResultRow>(
            "SELECT * FROM execution_step_results WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> anyhow::Result<Option<StepResult>> {
        let row = sqlx::query_as::<_, StepResultRow>(
            "SELECT * FROM execution_step_results WHERE execution_id = $1 AND step_id = $2",
        )
        .bind(execution_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn claim_step(
        &self,
        execution_id: &str,
        step_id: &str,
        timeout_ms: u64,
    ) -> anyhow::Result<StepClaim> {
        let now = now_ms();
        let stale_before = now - timeout_ms as i64;

        let claimed = sqlx::query_as::<_, StepResultRow>(
            r#"
            INSERT INTO execution_step_results
                (execution_id, step_id, started_at_epoch_ms, completed_at_epoch_ms, output, error)
            VALUES ($1, $2, $3, NULL, NULL, NULL)
            ON CONFLICT (execution_id, step_id) DO UPDATE
                SET started_at_epoch_ms = EXCLUDED.started_at_epoch_ms
                WHERE execution_step_results.completed_at_epoch_ms IS NULL
                  AND execution_step_results.started_at_epoch_ms < $4
            RETURNING *
            "#,
        )
        .bind(execution_id)
        .bind(step_id)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            return Ok(StepClaim::Claimed(row.into()));
        }

        // The upsert didn't win — either the step is already complete, or a
        // live worker holds it within the timeout window.
        let existing = self.get_step_result(execution_id, step_id).await?;
        match existing {
            Some(row) if row.is_complete() => Ok(StepClaim::AlreadyComplete(row)),
            Some(_) => Ok(StepClaim::Contended),
            None => Ok(StepClaim::Contended),
        }
    }

    async fn update_step(
        &self,
        execution_id: &str,
        step_id: &str,
        patch: StepResultPatch,
    ) -> anyhow::Result<StepResult> {
        let updated = sqlx::query_as::<_, StepResultRow>(
            r#"
            UPDATE execution_step_results
            SET completed_at_epoch_ms = COALESCE($3, completed_at_epoch_ms),
                output = COALESCE($4, output),
                error = COALESCE($5, error)
            WHERE execution_id = $1 AND step_id = $2 AND completed_at_epoch_ms IS NULL
            RETURNING *
            "#,
        )
        .bind(execution_id)
        .bind(step_id)
        .bind(patch.completed_at_epoch_ms)
        .bind(&patch.output)
        .bind(&patch.error)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(row.into());
        }

        self.get_step_result(execution_id, step_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("update_step on unclaimed step {execution_id}/{step_id}"))
    }

    async fn append_event(&self, event: WorkflowEvent) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_events
                (id, execution_id, type, name, payload, created_at, visible_at,
                 consumed_at, source_execution_id)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(&event.id)
        .bind(&event.execution_id)
        .bind(event.r#type.as_str())
        .bind(&event.name)
        .bind(&event.payload)
        .bind(event.created_at)
        .bind(event.visible_at)
        .bind(event.consumed_at)
        .bind(&event.source_execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn poll_due_events(
        &self,
        types: &[EventType],
        now_ms: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<WorkflowEvent>> {
        let type_strs: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT * FROM workflow_events
            WHERE type = ANY($1) AND consumed_at IS NULL
              AND (visible_at IS NULL OR visible_at <= $2)
            ORDER BY COALESCE(visible_at, created_at) ASC
            LIMIT $3
            "#,
        )
        .bind(&type_strs)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_event(
        &self,
        execution_id: &str,
        r#type: EventType,
        name: &str,
        now_ms: i64,
    ) -> anyhow::Result<Option<WorkflowEvent>> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT * FROM workflow_events
            WHERE execution_id = $1 AND type = $2 AND name = $3
              AND consumed_at IS NULL AND (visible_at IS NULL OR visible_at <= $4)
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(execution_id)
        .bind(r#type.as_str())
        .bind(name)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn consume_event(&self, event_id: &str, now_ms: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE workflow_events SET consumed_at = $2 WHERE id = $1 AND consumed_at IS NULL",
        )
        .bind(event_id)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ═══════════════════════════════════════════════════════════════════════════
// Row types for sqlx query_as
// ═══════════════════════════════════════════════════════════════════════════

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    workflow_id: String,
    steps: Value,
    status: String,
    input: Value,
    output: Option<Value>,
    error: Option<Value>,
    created_at: i64,
    updated_at: i64,
    start_at_epoch_ms: i64,
    completed_at_epoch_ms: Option<i64>,
    timeout_ms: Option<i64>,
    deadline_at_epoch_ms: Option<i64>,
}

impl From<ExecutionRow> for WorkflowExecution {
    fn from(row: ExecutionRow) -> Self {
        let steps: Vec<Step> = serde_json::from_value(row.steps).unwrap_or_default();
        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            steps,
            input: row.input,
            status: ExecutionStatus::parse(&row.status),
            start_at_epoch_ms: row.start_at_epoch_ms,
            deadline_at_epoch_ms: row.deadline_at_epoch_ms,
            timeout_ms: row.timeout_ms,
            completed_at_epoch_ms: row.completed_at_epoch_ms,
            output: row.output,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StepResultRow {
    execution_id: String,
    step_id: String,
    started_at_epoch_ms: i64,
    completed_at_epoch_ms: Option<i64>,
    output: Option<Value>,
    error: Option<Value>,
}

impl StepResultRow {
    fn is_complete(&self) -> bool {
        self.completed_at_epoch_ms.is_some()
    }
}

impl From<StepResultRow> for StepResult {
    fn from(row: StepResultRow) -> Self {
        Self {
            execution_id: row.execution_id,
            step_id: row.step_id,
            started_at_epoch_ms: row.started_at_epoch_ms,
            completed_at_epoch_ms: row.completed_at_epoch_ms,
            output: row.output,
            error: row.error,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    execution_id: String,
    r#type: String,
    name: Option<String>,
    payload: Option<Value>,
    created_at: i64,
    visible_at: Option<i64>,
    consumed_at: Option<i64>,
    source_execution_id: Option<String>,
}

impl From<EventRow> for WorkflowEvent {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            execution_id: row.execution_id,
            r#type: EventType::parse(&row.r#type),
            name: row.name,
            payload: row.payload,
            created_at: row.created_at,
            visible_at: row.visible_at,
            consumed_at: row.consumed_at,
            source_execution_id: row.source_execution_id,
        }
    }
}
