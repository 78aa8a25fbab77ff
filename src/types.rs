//! Core data model for workflows, executions, step results, and events.
//!
//! Mirrors the shapes persisted by the store — JSON fields travel as
//! `serde_json::Value`, timestamps as epoch milliseconds, IDs as opaque
//! UUID strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ═══════════════════════════════════════════════════════════════════════════
// Workflow definition (read-only)
// ═══════════════════════════════════════════════════════════════════════════

/// A workflow definition: an ordered, named set of steps forming a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub steps: Vec<Step>,
}

/// A single step in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the workflow.
    pub name: String,
    pub action: Action,
    /// Input template — JSON with embedded `@ref` expressions.
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#if: Option<Condition>,
    #[serde(default)]
    pub config: StepConfig,
}

/// The kind of work a step performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Tool {
        connection_id: String,
        tool_name: String,
    },
    Code {
        source: String,
    },
    Signal {
        signal_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

/// Per-step execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#loop: Option<LoopConfig>,
}

impl StepConfig {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(30_000)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(1).max(1)
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff_ms.unwrap_or(0)
    }
}

/// `foreach`-style fan-out over an items ref.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub r#for: ForSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForSpec {
    /// A ref string resolving to an array (e.g. `"@input.xs"`).
    pub items: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// A branch predicate evaluated against a `RefContext`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub r#ref: String,
    #[serde(default)]
    pub operator: ConditionOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[default]
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
}

// ═══════════════════════════════════════════════════════════════════════════
// Execution status
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Enqueued,
    Running,
    Success,
    Error,
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Enqueued => "enqueued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl ExecutionStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "enqueued" => ExecutionStatus::Enqueued,
            "running" => ExecutionStatus::Running,
            "success" => ExecutionStatus::Success,
            "error" => ExecutionStatus::Error,
            "cancelled" => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Enqueued,
        }
    }
}

/// A single run of a workflow against a specific input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    /// Denormalized snapshot of the workflow's steps at enqueue time.
    pub steps: Vec<Step>,
    pub input: Value,
    pub status: ExecutionStatus,
    pub start_at_epoch_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_at_epoch_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_epoch_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial update applied to an execution row.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub completed_at_epoch_ms: Option<i64>,
}

/// Filters accepted by `list_executions`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct ExecutionPage {
    pub items: Vec<WorkflowExecution>,
    pub total_count: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// Step results
// ═══════════════════════════════════════════════════════════════════════════

/// The checkpoint row for one step of one execution. Keyed by
/// `(execution_id, step_id)`; `completed_at_epoch_ms` is write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub execution_id: String,
    pub step_id: String,
    pub started_at_epoch_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_epoch_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StepResult {
    pub fn is_complete(&self) -> bool {
        self.completed_at_epoch_ms.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepResultPatch {
    pub completed_at_epoch_ms: Option<i64>,
    pub output: Option<Value>,
    pub error: Option<Value>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Events (signals, timers, dispatch deliveries)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Signal,
    Timer,
    Message,
    Output,
    StepStarted,
    StepCompleted,
    WorkflowStarted,
    WorkflowCompleted,
    /// Dispatch delivery: a new execution was enqueued.
    ExecutionCreated,
    /// Dispatch delivery: re-examine an execution (retry / wake-up).
    ExecutionRetry,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Signal => "signal",
            EventType::Timer => "timer",
            EventType::Message => "message",
            EventType::Output => "output",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::WorkflowStarted => "workflow_started",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::ExecutionCreated => "execution.created",
            EventType::ExecutionRetry => "execution.retry",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "signal" => EventType::Signal,
            "timer" => EventType::Timer,
            "message" => EventType::Message,
            "output" => EventType::Output,
            "step_started" => EventType::StepStarted,
            "step_completed" => EventType::StepCompleted,
            "workflow_started" => EventType::WorkflowStarted,
            "workflow_completed" => EventType::WorkflowCompleted,
            "execution.created" => EventType::ExecutionCreated,
            "execution.retry" => EventType::ExecutionRetry,
            _ => EventType::Message,
        }
    }
}

/// A durable, append-only event: signal deliveries, timer wake-ups, and the
/// dispatcher's own delivery queue all live in this one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: String,
    pub execution_id: String,
    pub r#type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_execution_id: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory ref resolution context
// ═══════════════════════════════════════════════════════════════════════════

/// The runtime context a `@ref` is resolved against for one step attempt.
#[derive(Debug, Clone, Default)]
pub struct RefContext {
    pub step_outputs: HashMap<String, Value>,
    pub workflow_input: Value,
    pub item: Option<Value>,
    pub index: Option<usize>,
}
