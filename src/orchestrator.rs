//! Top-level orchestrator: claims an execution, builds its ref context,
//! validates the DAG, walks it level by level with parallel fan-out, and
//! writes the final status.
//!
//! Same shape as a sequential workflow executor (create execution record,
//! iterate steps, write step records, finish execution), generalized from
//! strictly sequential iteration to level-grouped parallel fan-out.

use crate::dag::DagAnalyzer;
use crate::errors::EngineError;
use crate::events::EventBus;
use crate::ports::Clock;
use crate::refs::{evaluate_condition, resolve_all_refs};
use crate::step_executor::StepExecutor;
use crate::store::Store;
use crate::types::{ExecutionPatch, ExecutionStatus, RefContext, Step, StepResult, StepResultPatch};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// The outcome of one `run_once` invocation. Multiple invocations may be
/// needed to carry a single execution to a terminal state (signal waits,
/// durable sleeps, and stuck-step retries all return here without a
/// terminal write).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No execution matched `enqueued` — nothing to do.
    Skipped,
    Success,
    Error,
    Cancelled,
    WaitingForSignal,
    DurableSleep,
}

pub struct Executor {
    store: Arc<dyn Store>,
    step_executor: Arc<StepExecutor>,
    clock: Arc<dyn Clock>,
}

impl Executor {
    pub fn new(store: Arc<dyn Store>, step_executor: Arc<StepExecutor>, clock: Arc<dyn Clock>) -> Self {
        Self { store, step_executor, clock }
    }

    pub async fn run_once(&self, execution_id: &str) -> anyhow::Result<RunOutcome> {
        let Some(execution) = self.store.claim_execution(execution_id).await? else {
            return Ok(RunOutcome::Skipped);
        };

        info!(execution_id, workflow_id = %execution.workflow_id, "claimed execution");

        let results = self.store.get_step_results(execution_id).await?;
        let mut step_outputs = build_step_outputs(&results, &execution.steps);

        let workflow_input = match &execution.input {
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| execution.input.clone()),
            other => other.clone(),
        };

        let plan = match DagAnalyzer::analyze(&execution.steps) {
            Ok(plan) => plan,
            Err(EngineError::Validation(message)) => {
                self.finish_error(execution_id, &message).await?;
                return Ok(RunOutcome::Error);
            }
            Err(other) => {
                self.finish_error(execution_id, &other.to_string()).await?;
                return Ok(RunOutcome::Error);
            }
        };

        let mut skipped_branch_roots: HashSet<String> = HashSet::new();
        let mut completed_steps: Vec<String> = Vec::new();
        let mut skipped_steps: Vec<String> = Vec::new();
        let mut last_step: Option<String> = None;

        for group in &plan.level_groups {
            let pending: Vec<&String> = group
                .iter()
                .filter(|name| !step_outputs.contains_key(name.as_str()))
                .collect();

            if pending.is_empty() {
                completed_steps.extend(group.iter().cloned());
                continue;
            }

            let tasks = pending.into_iter().map(|name| {
                let step = execution.steps.iter().find(|s| &s.name == name).expect("step in plan");
                let root = plan.branch_membership.get(name).cloned().flatten();
                let skip_now = root.as_deref().is_some_and(|r| skipped_branch_roots.contains(r));
                let ctx = RefContext {
                    step_outputs: step_outputs.clone(),
                    workflow_input: workflow_input.clone(),
                    item: None,
                    index: None,
                };
                self.process_step(execution_id, step, ctx, skip_now)
            });

            let outcomes = futures::future::join_all(tasks).await;

            for outcome in outcomes {
                match outcome {
                    Ok(StepOutcome::Completed { name, output }) => {
                        step_outputs.insert(name.clone(), output);
                        completed_steps.push(name.clone());
                        last_step = Some(name);
                    }
                    Ok(StepOutcome::Skipped { name, reason, is_branch_root }) => {
                        let output = json!({ "_skipped": true, "reason": reason });
                        self.persist_skip(execution_id, &execution.steps, &name, &output).await?;
                        step_outputs.insert(name.clone(), output);
                        skipped_steps.push(name.clone());
                        if is_branch_root {
                            skipped_branch_roots.insert(name);
                        }
                    }
                    Err(err) => return self.handle_error(execution_id, err).await,
                }
            }
        }

        let output = json!({
            "completedSteps": completed_steps,
            "skippedSteps": skipped_steps,
            "lastStep": last_step,
            "message": "workflow completed successfully",
        });

        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Success),
                    output: Some(output),
                    error: None,
                    completed_at_epoch_ms: Some(self.clock.now_ms()),
                },
            )
            .await?;

        info!(execution_id, "execution completed successfully");
        Ok(RunOutcome::Success)
    }

    async fn handle_error(&self, execution_id: &str, err: EngineError) -> anyhow::Result<RunOutcome> {
        match err {
            EngineError::WorkflowCancelled { .. } => {
                self.store
                    .update_execution(
                        execution_id,
                        ExecutionPatch {
                            status: Some(ExecutionStatus::Cancelled),
                            output: None,
                            error: None,
                            completed_at_epoch_ms: Some(self.clock.now_ms()),
                        },
                    )
                    .await?;
                Ok(RunOutcome::Cancelled)
            }
            EngineError::WaitingForSignal { .. } => Ok(RunOutcome::WaitingForSignal),
            EngineError::WaitingForTimer { .. } => Ok(RunOutcome::DurableSleep),
            EngineError::StuckStep { execution_id: exec, step } => {
                warn!(execution_id = %exec, step, "step claim contended, scheduling short retry");
                let bus = EventBus::new(self.store.clone(), self.clock.clone());
                bus.schedule_retry(&exec, 250).await?;
                Ok(RunOutcome::Error)
            }
            // The row vanished between `claim_execution` and this step running.
            // There's nothing left to write a terminal status onto — report
            // and drop the delivery rather than attempt an update that would
            // match zero rows.
            EngineError::ExecutionNotFound(id) => {
                error!(execution_id = %id, "execution row not found mid-run, dropping delivery");
                Ok(RunOutcome::Error)
            }
            other => {
                error!(execution_id, "execution failed: {}", other);
                self.finish_error(execution_id, &other.to_string()).await?;
                Ok(RunOutcome::Error)
            }
        }
    }

    async fn finish_error(&self, execution_id: &str, message: &str) -> anyhow::Result<()> {
        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Error),
                    output: None,
                    error: Some(json!({ "message": message })),
                    completed_at_epoch_ms: Some(self.clock.now_ms()),
                },
            )
            .await
    }

    /// Write the terminal `_skipped` step-result row a branch-conditional
    /// skip produces. Claims the row first so a skip racing a completed
    /// attempt from another worker never overwrites it.
    async fn persist_skip(
        &self,
        execution_id: &str,
        steps: &[Step],
        name: &str,
        output: &Value,
    ) -> anyhow::Result<()> {
        let timeout_ms = steps.iter().find(|s| s.name == name).map(|s| s.config.timeout_ms()).unwrap_or(30_000);
        match self.store.claim_step(execution_id, name, timeout_ms).await? {
            crate::store::StepClaim::AlreadyComplete(_) => Ok(()),
            crate::store::StepClaim::Contended => Ok(()),
            crate::store::StepClaim::Claimed(_) => {
                self.store
                    .update_step(
                        execution_id,
                        name,
                        StepResultPatch {
                            completed_at_epoch_ms: Some(self.clock.now_ms()),
                            output: Some(output.clone()),
                            error: None,
                        },
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Resolve, skip-check, and (if applicable) loop-fan-out a single
    /// pending step. Parallel siblings within a level each get their own
    /// call to this method.
    async fn process_step(
        &self,
        execution_id: &str,
        step: &Step,
        ctx: RefContext,
        skip_via_branch: bool,
    ) -> Result<StepOutcome, EngineError> {
        if skip_via_branch {
            return Ok(StepOutcome::Skipped {
                name: step.name.clone(),
                reason: "ancestor branch skipped".to_string(),
                is_branch_root: step.r#if.is_some(),
            });
        }

        if let Some(cond) = &step.r#if {
            let outcome = evaluate_condition(cond, &ctx);
            // Evaluation errors fail open: treated as "do not skip".
            if outcome.error.is_none() && !outcome.satisfied {
                return Ok(StepOutcome::Skipped {
                    name: step.name.clone(),
                    reason: format!("condition `{}` not satisfied", cond.r#ref),
                    is_branch_root: true,
                });
            }
        }

        if let Some(loop_cfg) = &step.config.r#loop {
            return self.run_loop(execution_id, step, &loop_cfg.for_items_ref(), loop_cfg.for_limit(), ctx).await;
        }

        let (resolved_input, resolution_errors) = resolve_all_refs(&step.input, &ctx);
        if !resolution_errors.is_empty() {
            warn!(step = %step.name, "ref resolution had {} error(s)", resolution_errors.len());
        }

        let result = self.step_executor.execute_step(execution_id, step, resolved_input).await?;
        Ok(StepOutcome::Completed {
            name: step.name.clone(),
            output: result.output.unwrap_or(Value::Null),
        })
    }

    async fn run_loop(
        &self,
        execution_id: &str,
        step: &Step,
        items_ref: &str,
        limit: Option<usize>,
        ctx: RefContext,
    ) -> Result<StepOutcome, EngineError> {
        let items = resolve_items(items_ref, &ctx)?;
        let bound = limit.unwrap_or(items.len()).min(items.len());

        let mut outputs = Vec::with_capacity(bound);
        for (index, item) in items.into_iter().take(bound).enumerate() {
            let synthetic_name = format!("{}[{}]", step.name, index);

            if let Some(existing) = self
                .store
                .get_step_result(execution_id, &synthetic_name)
                .await
                .map_err(|e| EngineError::Validation(e.to_string()))?
            {
                if existing.is_complete() {
                    outputs.push(existing.output.unwrap_or(Value::Null));
                    continue;
                }
            }

            let mut iter_ctx = ctx.clone();
            iter_ctx.item = Some(item);
            iter_ctx.index = Some(index);

            let (resolved_input, _) = resolve_all_refs(&step.input, &iter_ctx);

            let synthetic_step = Step {
                name: synthetic_name,
                action: step.action.clone(),
                input: step.input.clone(),
                r#if: None,
                config: step.config.clone(),
            };

            let result = self
                .step_executor
                .execute_step(execution_id, &synthetic_step, resolved_input)
                .await?;
            outputs.push(result.output.unwrap_or(Value::Null));
        }

        Ok(StepOutcome::Completed { name: step.name.clone(), output: Value::Array(outputs) })
    }
}

enum StepOutcome {
    Completed { name: String, output: Value },
    Skipped { name: String, reason: String, is_branch_root: bool },
}

impl crate::types::LoopConfig {
    fn for_items_ref(&self) -> String {
        self.r#for.items.clone()
    }

    fn for_limit(&self) -> Option<usize> {
        self.r#for.limit
    }
}

/// Resolve a loop's `items` ref to a concrete array. Also accepts the
/// `{content: [{text: "<json array>"}]}` shape tool results commonly take,
/// parsing the embedded JSON text.
fn resolve_items(items_ref: &str, ctx: &RefContext) -> Result<Vec<Value>, EngineError> {
    let (resolved, errors) = resolve_all_refs(&Value::String(items_ref.to_string()), ctx);
    if !errors.is_empty() {
        return Err(EngineError::Validation(format!(
            "could not resolve loop items ref `{items_ref}`"
        )));
    }

    match resolved {
        Value::Array(items) => Ok(items),
        Value::Object(ref map) => {
            if let Some(Value::Array(content)) = map.get("content") {
                if let Some(Value::Object(first)) = content.first() {
                    if let Some(Value::String(text)) = first.get("text") {
                        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
                            return Ok(items);
                        }
                    }
                }
            }
            Err(EngineError::Validation(format!("loop items ref `{items_ref}` did not resolve to an array")))
        }
        _ => Err(EngineError::Validation(format!("loop items ref `{items_ref}` did not resolve to an array"))),
    }
}

/// Reconstruct the in-memory step-output map from persisted, completed
/// step results. Loop steps have no row of their own — their aggregate
/// output is derived from however many of their synthetic `name[i]` rows
/// are complete, so a resumed execution only re-runs the missing
/// iterations (idempotent resumption).
fn build_step_outputs(results: &[StepResult], steps: &[Step]) -> HashMap<String, Value> {
    let mut by_id: HashMap<&str, &StepResult> = HashMap::new();
    for r in results {
        if r.is_complete() {
            by_id.insert(r.step_id.as_str(), r);
        }
    }

    let mut outputs = HashMap::new();
    for step in steps {
        if step.config.r#loop.is_some() {
            let mut synthetic: Vec<(usize, &StepResult)> = by_id
                .iter()
                .filter_map(|(id, r)| {
                    let prefix = format!("{}[", step.name);
                    let suffix = id.strip_prefix(&prefix)?.strip_suffix(']')?;
                    suffix.parse::<usize>().ok().map(|idx| (idx, *r))
                })
                .collect();
            if synthetic.is_empty() {
                continue;
            }
            synthetic.sort_by_key(|(idx, _)| *idx);
            // Only treat the loop as complete if the synthetic indices are
            // contiguous from 0 — otherwise some iterations are still
            // pending and the step must remain in the pending set.
            let contiguous = synthetic.iter().enumerate().all(|(i, (idx, _))| i == *idx);
            if contiguous {
                let values: Vec<Value> = synthetic
                    .into_iter()
                    .map(|(_, r)| r.output.clone().unwrap_or(Value::Null))
                    .collect();
                outputs.insert(step.name.clone(), Value::Array(values));
            }
        } else if let Some(r) = by_id.get(step.name.as_str()) {
            outputs.insert(step.name.clone(), r.output.clone().unwrap_or(Value::Null));
        }
    }
    outputs
}
