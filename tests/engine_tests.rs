//! Integration tests for the durable workflow engine, run entirely against
//! `MemoryStore` — no external services, fully deterministic. Covers the
//! six universal invariants and the six end-to-end scenarios.
//!
//! A Postgres-backed smoke test sits in its own `pg_tests` module, gated
//! behind the `postgres` feature and skipped gracefully when `DATABASE_URL`
//! isn't set (same convention the rest of this crate's test suite uses).

use async_trait::async_trait;
use durable_flow::dag::DagAnalyzer;
use durable_flow::engine::Engine;
use durable_flow::orchestrator::{Executor, RunOutcome};
use durable_flow::ports::{Clock, CodeRunner, ToolInvoker};
use durable_flow::step_executor::StepExecutor;
use durable_flow::store::memory::MemoryStore;
use durable_flow::store::Store;
use durable_flow::types::{
    Action, Condition, ConditionOperator, ExecutionStatus, ForSpec, LoopConfig, Step, StepConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Returns whatever JSON literal trails a `const:` prefix in `tool_name` —
/// a canned-output test double standing in for a real tool registry.
struct ConstToolInvoker;

#[async_trait]
impl ToolInvoker for ConstToolInvoker {
    async fn invoke(
        &self,
        _connection_id: &str,
        tool_name: &str,
        _args: Value,
        _deadline_ms: u64,
    ) -> anyhow::Result<Value> {
        let literal = tool_name.strip_prefix("const:").unwrap_or("null");
        Ok(serde_json::from_str(literal)?)
    }
}

/// `"mul10"` multiplies its numeric input by 10 — used to drive the
/// `foreach` scenario without a real sandboxed runtime.
struct ScriptCodeRunner;

#[async_trait]
impl CodeRunner for ScriptCodeRunner {
    async fn run(&self, source: &str, args: Value, _step_name: &str, _deadline_ms: u64) -> anyhow::Result<Value> {
        match source {
            "mul10" => {
                let n = args.as_f64().ok_or_else(|| anyhow::anyhow!("mul10 expects a number"))?;
                Ok(json!(n * 10.0))
            }
            other => anyhow::bail!("unknown script `{other}`"),
        }
    }

    async fn validate(&self, _source: &str, _step_name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

struct FixedClock(std::sync::atomic::AtomicI64);

impl FixedClock {
    fn new(start: i64) -> Self {
        Self(std::sync::atomic::AtomicI64::new(start))
    }
    fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

fn tool_step(name: &str, output_json: &str, input: Value) -> Step {
    Step {
        name: name.to_string(),
        action: Action::Tool { connection_id: "test".to_string(), tool_name: format!("const:{output_json}") },
        input,
        r#if: None,
        config: StepConfig::default(),
    }
}

fn harness() -> (Arc<dyn Store>, Arc<Executor>, Engine) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let clock = Arc::new(durable_flow::ports::SystemClock);
    let step_executor = Arc::new(StepExecutor::new(
        store.clone(),
        Arc::new(ConstToolInvoker),
        Some(Arc::new(ScriptCodeRunner)),
        clock.clone(),
    ));
    let executor = Arc::new(Executor::new(store.clone(), step_executor, clock.clone()));
    let engine = Engine::new(store.clone(), clock);
    (store, executor, engine)
}

#[tokio::test]
async fn s1_linear_success() {
    let (store, executor, engine) = harness();

    let steps = vec![
        tool_step("a", r#"{"x":1}"#, json!({})),
        tool_step("b", r#"{"y":2}"#, json!({ "x": "@a.x" })),
        tool_step("c", r#"{"z":3}"#, json!({ "y": "@b.y" })),
    ];
    let id = engine.enqueue_execution("wf-s1", steps, json!({})).await.unwrap();

    let outcome = executor.run_once(&id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Success);

    let execution = store.get_execution(&id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.output.unwrap()["completedSteps"], json!(["a", "b", "c"]));

    let c_result = store.get_step_result(&id, "c").await.unwrap().unwrap();
    assert_eq!(c_result.output, Some(json!({ "z": 3 })));
}

#[tokio::test]
async fn s2_fan_out_join_shares_a_level() {
    let (store, executor, engine) = harness();

    let steps = vec![
        tool_step("root", r#"{"v":1}"#, json!({})),
        tool_step("l1", r#"{"v":2}"#, json!({ "v": "@root" })),
        tool_step("l2", r#"{"v":3}"#, json!({ "v": "@root" })),
        tool_step("join", r#"{"done":true}"#, json!({ "a": "@l1", "b": "@l2" })),
    ];

    let plan = DagAnalyzer::analyze(&steps).unwrap();
    assert_eq!(plan.level["root"], 0);
    assert_eq!(plan.level["l1"], 1);
    assert_eq!(plan.level["l2"], 1);
    assert_eq!(plan.level["join"], 2);

    let id = engine.enqueue_execution("wf-s2", steps, json!({ "seed": 42 })).await.unwrap();
    let outcome = executor.run_once(&id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Success);

    assert!(store.get_step_result(&id, "l1").await.unwrap().unwrap().is_complete());
    assert!(store.get_step_result(&id, "l2").await.unwrap().unwrap().is_complete());
}

#[tokio::test]
async fn s3_branch_skip_propagates_to_descendants() {
    let (store, executor, engine) = harness();

    let decide = tool_step("decide", r#"{"ok":false}"#, json!({}));
    let mut branch = tool_step("branch", r#"{"taken":true}"#, json!({ "v": "@decide" }));
    branch.r#if = Some(Condition {
        r#ref: "@decide.ok".to_string(),
        operator: ConditionOperator::Eq,
        value: json!(true),
    });
    let leaf = tool_step("leaf", r#"{"never":true}"#, json!({ "v": "@branch" }));

    let id = engine.enqueue_execution("wf-s3", vec![decide, branch, leaf], json!({})).await.unwrap();
    let outcome = executor.run_once(&id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Success);

    let execution = store.get_execution(&id).await.unwrap().unwrap();
    let output = execution.output.unwrap();
    let skipped = output["skippedSteps"].as_array().unwrap();
    assert!(skipped.iter().any(|v| v == "branch"));
    assert!(skipped.iter().any(|v| v == "leaf"));

    let branch_result = store.get_step_result(&id, "branch").await.unwrap().unwrap();
    assert_eq!(branch_result.output.unwrap()["_skipped"], json!(true));
}

#[tokio::test]
async fn s4_signal_wait_then_resume() {
    let (store, executor, engine) = harness();

    let ask = Step {
        name: "ask".to_string(),
        action: Action::Signal { signal_name: "approve".to_string(), timeout_ms: Some(60_000) },
        input: json!({}),
        r#if: None,
        config: StepConfig::default(),
    };
    let next = tool_step("next", r#"{"done":true}"#, json!({ "a": "@ask" }));

    let id = engine.enqueue_execution("wf-s4", vec![ask, next], json!({})).await.unwrap();

    let outcome = executor.run_once(&id).await.unwrap();
    assert_eq!(outcome, RunOutcome::WaitingForSignal);

    let execution = store.get_execution(&id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert!(execution.completed_at_epoch_ms.is_none());

    engine.send_signal(&id, "approve", Some(json!({ "ok": true }))).await.unwrap();

    let outcome = executor.run_once(&id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Success);

    let ask_result = store.get_step_result(&id, "ask").await.unwrap().unwrap();
    assert_eq!(ask_result.output, Some(json!({ "ok": true })));
}

#[tokio::test]
async fn s5_crash_recovery_reclaims_a_stale_step() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    // Simulate a worker that claimed the step and then crashed: a row with
    // `started_at` set and `completed_at` still null.
    let claim = store.claim_step("exec-1", "s", 1_000).await.unwrap();
    assert!(matches!(claim, durable_flow::store::StepClaim::Claimed(_)));

    // Immediately retrying within the timeout window is contended.
    let contended = store.claim_step("exec-1", "s", 1_000).await.unwrap();
    assert!(matches!(contended, durable_flow::store::StepClaim::Contended));

    // A real clock source would need to actually wait out the timeout; this
    // in-memory store reads `chrono::Utc::now()` directly, so there is no
    // seam to fast-forward without real sleep. Sleep past the window.
    tokio::time::sleep(std::time::Duration::from_millis(1_050)).await;

    let reclaimed = store.claim_step("exec-1", "s", 1_000).await.unwrap();
    assert!(matches!(reclaimed, durable_flow::store::StepClaim::Claimed(_)));
}

#[tokio::test]
async fn s6_foreach_preserves_order_with_synthetic_rows() {
    let (store, executor, engine) = harness();

    let fan = Step {
        name: "fan".to_string(),
        action: Action::Code { source: "mul10".to_string() },
        input: json!("@item"),
        r#if: None,
        config: StepConfig {
            r#loop: Some(LoopConfig { r#for: ForSpec { items: "@input.xs".to_string(), limit: None } }),
            ..Default::default()
        },
    };

    let id = engine.enqueue_execution("wf-s6", vec![fan], json!({ "xs": [1, 2, 3] })).await.unwrap();
    let outcome = executor.run_once(&id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Success);

    for (i, expected) in [(0, 10.0), (1, 20.0), (2, 30.0)] {
        let row = store.get_step_result(&id, &format!("fan[{i}]")).await.unwrap().unwrap();
        assert_eq!(row.output, Some(json!(expected)));
    }

    let execution = store.get_execution(&id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn cancellation_blocks_new_step_rows() {
    let (store, executor, engine) = harness();

    let steps = vec![
        tool_step("a", r#"{"x":1}"#, json!({})),
        tool_step("b", r#"{"y":2}"#, json!({ "x": "@a.x" })),
    ];
    let id = engine.enqueue_execution("wf-cancel", steps, json!({})).await.unwrap();

    store.cancel_execution(&id).await.unwrap();

    let outcome = executor.run_once(&id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Skipped);

    assert!(store.get_step_result(&id, "a").await.unwrap().is_none());
}

#[tokio::test]
async fn ref_resolution_is_identity_without_at_signs() {
    let ctx = durable_flow::types::RefContext::default();
    let input = json!({ "plain": "text", "n": 7, "list": [1, 2] });
    let (resolved, errors) = durable_flow::refs::resolve_all_refs(&input, &ctx);
    assert!(errors.is_empty());
    assert_eq!(resolved, input);
}

// ═══════════════════════════════════════════════════════════════════════════
// Postgres smoke test (requires DATABASE_URL — skipped if not set)
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(feature = "postgres")]
mod pg_tests {
    use durable_flow::store::postgres::PgStore;
    use durable_flow::store::Store;
    use durable_flow::types::{ExecutionStatus, Step, Action, StepConfig};
    use serde_json::json;

    fn get_database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    #[tokio::test]
    async fn test_pg_store_claim_and_complete_execution() {
        let Some(database_url) = get_database_url() else {
            eprintln!("Skipping PgStore test — DATABASE_URL not set");
            return;
        };

        let store = PgStore::new(&database_url).await.unwrap();
        store.migrate().await.unwrap();

        let id = format!("test-exec-{}", uuid::Uuid::new_v4());
        let steps = vec![Step {
            name: "a".to_string(),
            action: Action::Code { source: "noop".to_string() },
            input: json!({}),
            r#if: None,
            config: StepConfig::default(),
        }];

        store
            .put_execution(durable_flow::types::WorkflowExecution {
                id: id.clone(),
                workflow_id: "wf".to_string(),
                steps,
                input: json!({}),
                status: ExecutionStatus::Enqueued,
                start_at_epoch_ms: 0,
                deadline_at_epoch_ms: None,
                timeout_ms: None,
                completed_at_epoch_ms: None,
                output: None,
                error: None,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();

        let claimed = store.claim_execution(&id).await.unwrap();
        assert!(claimed.is_some());
        assert_eq!(claimed.unwrap().status, ExecutionStatus::Running);

        let refetched = store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(refetched.status, ExecutionStatus::Running);
    }
}
