//! The workflow engine: DAG dispatch, branch routing, retries, status
//! streaming, and final-result assembly.
//!
//! Each ready block runs as its own bounded task. A completing block
//! marks itself terminal under the completion lock, reclaims upstream
//! outputs whose consumers have all finished, and dispatches whichever
//! dependents became ready. A failing block dispatches nothing — its
//! dependents simply never start, and independent branches continue.

pub mod graph;

mod foreach;
mod run;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backoff::{retry_with_backoff, RetryPolicy};
use crate::checker;
use crate::context::RunContext;
use crate::error::{classify, EngineError, Result};
use crate::events::StatusUpdate;
use crate::exec::ExecutorRegistry;
use crate::model::{
    Block, BlockStatus, BlockType, ExecutionResult, JsonMap, RetryAttempt, RunStatus, Workflow,
};
use graph::{preflight_warnings, Graph};
use run::RunState;

/// Reserved run-input key naming the run's owner.
const USER_ID_KEY: &str = "__user_id__";

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on simultaneously running blocks per run.
    pub max_parallel_blocks: usize,
    /// Workflow-level deadline.
    pub workflow_timeout: Duration,
    /// Default per-block timeout.
    pub block_timeout: Duration,
    /// Minimum timeout granted to LLM blocks.
    pub llm_timeout_floor: Duration,
    /// Circuit-breaker trip threshold (consecutive block failures per
    /// error source).
    pub breaker_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_blocks: 20,
            workflow_timeout: Duration::from_secs(600),
            block_timeout: Duration::from_secs(30),
            llm_timeout_floor: Duration::from_secs(120),
            breaker_threshold: 5,
        }
    }
}

/// The workflow execution engine.
///
/// # Example
///
/// ```no_run
/// use blockflow::collab::mock::{StaticCatalog, StaticToolRegistry};
/// use blockflow::{RunContext, WorkflowEngine};
/// use std::sync::Arc;
///
/// # async fn run(workflow: blockflow::Workflow) -> blockflow::Result<()> {
/// let ctx = RunContext::builder(
///     Arc::new(StaticToolRegistry::new()),
///     Arc::new(StaticCatalog::new()),
/// )
/// .build();
/// let engine = WorkflowEngine::new(ctx);
/// let result = engine.execute(&workflow, Default::default()).await?;
/// println!("{:?}", result.status);
/// # Ok(())
/// # }
/// ```
pub struct WorkflowEngine {
    ctx: RunContext,
    registry: Arc<ExecutorRegistry>,
    config: EngineConfig,
}

impl WorkflowEngine {
    /// Engine with the default executor registry and config.
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            registry: Arc::new(ExecutorRegistry::with_defaults()),
            config: EngineConfig::default(),
        }
    }

    /// Replace the executor registry.
    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Replace the engine config.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Run a workflow to completion.
    pub async fn execute(&self, workflow: &Workflow, input: JsonMap) -> Result<ExecutionResult> {
        let started = Instant::now();
        workflow.validate()?;
        for block in &workflow.blocks {
            if !self.registry.supports(block.block_type) {
                return Err(EngineError::InvalidWorkflow(format!(
                    "no executor registered for block type '{}'",
                    block.block_type
                )));
            }
        }
        for warning in preflight_warnings(workflow) {
            warn!(workflow = %workflow.id, "{}", warning);
        }

        // Globals: variable defaults overridden by caller input.
        let mut globals = JsonMap::new();
        for variable in &workflow.variables {
            if let Some(default) = &variable.default {
                globals.insert(variable.name.clone(), default.clone());
            }
        }
        let user_id = input
            .get(USER_ID_KEY)
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        for (key, value) in input {
            globals.insert(key, value);
        }

        let run_ctx = self.ctx.for_run(
            self.config.breaker_threshold,
            workflow.workflow_model_id.clone(),
            user_id,
        );
        let cancel = run_ctx.cancellation.clone();

        let dag = Graph::build(workflow);
        if dag.start_blocks.is_empty() && !workflow.blocks.is_empty() {
            return Err(EngineError::InvalidWorkflow(
                "no start blocks found — circular dependency".into(),
            ));
        }
        let start_blocks = dag.start_blocks.clone();
        info!(
            workflow = %workflow.id,
            blocks = workflow.blocks.len(),
            starts = start_blocks.len(),
            "dispatching workflow"
        );

        let max_parallel = workflow
            .max_parallel_blocks
            .unwrap_or(self.config.max_parallel_blocks);
        let state = Arc::new(RunState::new(
            workflow
                .blocks
                .iter()
                .map(|b| (b.id.clone(), b.clone()))
                .collect(),
            dag,
            globals,
            run_ctx,
            self.registry.clone(),
            self.config.clone(),
            max_parallel,
        ));

        // Deadline watchdog: flips the cancellation flag; in-flight
        // blocks observe it and settle.
        let deadline = workflow
            .workflow_timeout
            .map(Duration::from_secs)
            .unwrap_or(self.config.workflow_timeout);
        let watchdog = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(deadline).await;
                warn!("workflow deadline elapsed, cancelling run");
                cancel.store(true, std::sync::atomic::Ordering::Relaxed);
            }
        });

        for id in start_blocks {
            spawn_block(state.clone(), id);
        }
        state.wait_idle().await;
        watchdog.abort();

        Ok(finalize(&state, workflow, started))
    }
}

/// Assemble the final [`ExecutionResult`] from the settled run state.
fn finalize(state: &Arc<RunState>, workflow: &Workflow, started: Instant) -> ExecutionResult {
    let states: HashMap<String, crate::model::BlockState> =
        state.states.read().expect("state lock").clone();

    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut errors = Vec::new();
    let mut total_tokens = 0u64;
    for (id, block_state) in &states {
        match block_state.status {
            BlockStatus::Completed => completed += 1,
            BlockStatus::Failed => {
                failed += 1;
                errors.push(format!(
                    "{}: {}",
                    id,
                    block_state.error.as_deref().unwrap_or("unknown error")
                ));
            }
            _ => {}
        }
        if let Some(tokens) = block_state
            .outputs
            .as_ref()
            .and_then(|o| o.get("totalTokens"))
            .and_then(Value::as_u64)
        {
            total_tokens += tokens;
        }
    }
    errors.sort();

    let status = if failed == 0 {
        RunStatus::Completed
    } else if completed == 0 {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    };

    // Terminal blocks (no dependents) contribute the run output.
    let mut output = JsonMap::new();
    for block in &workflow.blocks {
        let is_terminal_block = state
            .graph
            .dependents
            .get(&block.id)
            .map(|deps| deps.is_empty())
            .unwrap_or(true);
        if !is_terminal_block {
            continue;
        }
        if states.get(&block.id).map(|s| s.status) == Some(BlockStatus::Completed) {
            if let Some(block_output) = state.output_of(&block.id) {
                output.insert(block.id.clone(), Value::Object(block_output));
            }
        }
    }

    ExecutionResult {
        status,
        output,
        block_states: states,
        error: if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        },
        total_tokens,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Spawn one block task, deduplicating dispatch.
fn spawn_block(state: Arc<RunState>, id: String) {
    if !state.reserve_dispatch(&id) {
        return;
    }
    tokio::spawn(async move {
        run_block(&state, &id).await;
        state.task_finished();
    });
}

/// Run a single block end-to-end: inputs, execution (with timeout,
/// panic recovery, and retry), checker, bookkeeping, and dependent
/// dispatch.
async fn run_block(state: &Arc<RunState>, id: &str) {
    let permit = state
        .semaphore
        .acquire()
        .await
        .expect("semaphore never closed");

    let Some(block) = state.blocks.get(id).cloned() else {
        error!(block = id, "dispatched unknown block");
        state.mark_terminal(id);
        return;
    };

    if state.ctx.is_cancelled() {
        state.transition(id, BlockStatus::Skipped);
        state.mark_terminal(id);
        return;
    }

    // The for-each driver parks while its subgraph runs; holding a
    // permit there could deadlock a small semaphore.
    if block.block_type == BlockType::ForEach {
        drop(permit);
    }

    let inputs = state.build_inputs(id);
    state.transition(id, BlockStatus::Running);
    state.with_state(id, |s| s.inputs = Some(Value::Object(inputs.clone())));
    state
        .ctx
        .status
        .emit(StatusUpdate::running(id, Some(Value::Object(inputs.clone()))));
    debug!(block = id, kind = %block.block_type, "block started");

    let result = execute_block(state, &block, &inputs).await;

    match result {
        Ok(output) => {
            // Post-hoc checker for LLM blocks: a failed verdict converts
            // the result to a failure.
            if state.ctx.agent.checker_enabled && block.block_type == BlockType::LlmInference {
                let verdict = checker::check_block(&state.ctx, &block, &inputs, &output).await;
                if !verdict.passed {
                    let message = format!(
                        "checker verdict: {}; actual output: {}",
                        verdict.reason,
                        checker::summarize_output(&output)
                    );
                    finish_failed(state, &block, message);
                    return;
                }
            }
            finish_completed(state, &block, output);
        }
        Err(e) => {
            // An HTTP failure can still carry a parsed body; keep it on
            // the block state for diagnostics and response shaping.
            if let EngineError::Http {
                output: Some(body), ..
            } = &e
            {
                let body = body.clone();
                state.with_state(id, |s| s.outputs = Some(body));
            }
            let c = classify(&e);
            // A breaker already open for this source means the failure
            // was short-circuited rather than retried.
            if state.ctx.breaker.is_tripped(c.source) {
                state
                    .ctx
                    .status
                    .emit(StatusUpdate::breaker_tripped(id, c.source.as_str()));
            }
            state.ctx.breaker.record_failure(c.source);
            finish_failed(state, &block, format!("{} ({})", c.guidance, c.detail));
        }
    }
}

/// Run the block's executor with timeout, panic recovery, and the
/// configured retry policy.
async fn execute_block(state: &Arc<RunState>, block: &Block, inputs: &JsonMap) -> Result<JsonMap> {
    let policy = block
        .retry
        .as_ref()
        .map(RetryPolicy::from_spec)
        .filter(|p| p.max_retries > 0);

    match policy {
        None => attempt_block(state, block, inputs).await,
        Some(policy) => {
            let id = block.id.clone();
            let state_for_retry = state.clone();
            let mut on_retry =
                move |attempt: u32, delay: Duration, c: &crate::error::Classified| {
                    state_for_retry.transition(&id, BlockStatus::Retrying);
                    state_for_retry.with_state(&id, |s| {
                        s.retry_count = attempt;
                        s.retry_history.push(RetryAttempt {
                            attempt,
                            error: c.detail.clone(),
                            delay_ms: delay.as_millis() as u64,
                            at: chrono::Utc::now(),
                        });
                    });
                    state_for_retry.ctx.status.emit(StatusUpdate::retrying(
                        &id,
                        attempt,
                        delay.as_millis() as u64,
                        &c.detail,
                    ));
                };

            retry_with_backoff(
                &policy,
                Some(state.ctx.breaker.as_ref()),
                Some(state.ctx.cancellation.as_ref()),
                Some(&mut on_retry),
                |attempt| async move {
                    if attempt > 0 {
                        state.transition(&block.id, BlockStatus::Running);
                    }
                    attempt_block(state, block, inputs).await
                },
            )
            .await
        }
    }
}

/// One execution attempt: for-each goes through the driver, everything
/// else through its registered executor under a per-block timeout, with
/// panics recovered at this boundary.
async fn attempt_block(state: &Arc<RunState>, block: &Block, inputs: &JsonMap) -> Result<JsonMap> {
    if block.block_type == BlockType::ForEach {
        // The driver owns its own pacing; the workflow deadline still
        // applies through the cancellation flag.
        return foreach::drive(state, block, inputs).await;
    }

    let executor = state
        .registry
        .get(block.block_type)
        .ok_or_else(|| EngineError::InvalidWorkflow(format!(
            "no executor for block type '{}'",
            block.block_type
        )))?;

    let timeout = effective_timeout(state, block);
    let guarded = AssertUnwindSafe(executor.execute(&state.ctx, block, inputs)).catch_unwind();

    match tokio::time::timeout(timeout, guarded).await {
        Err(_) => Err(EngineError::Timeout(timeout)),
        Ok(Err(panic)) => Err(EngineError::Panic(panic_message(panic))),
        Ok(Ok(result)) => result,
    }
}

/// Per-block timeout: the block's own setting, the engine default, and
/// a floor for LLM blocks (model calls are slow by nature).
fn effective_timeout(state: &Arc<RunState>, block: &Block) -> Duration {
    let configured = block
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(state.config.block_timeout);
    if block.block_type == BlockType::LlmInference {
        configured.max(state.config.llm_timeout_floor)
    } else {
        configured
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Completed-block bookkeeping: store the output, emit status, call the
/// checkpoint, reclaim upstream memory, dispatch dependents.
fn finish_completed(state: &Arc<RunState>, block: &Block, output: JsonMap) {
    let id = &block.id;
    state.set_output(id, output.clone());
    state.with_state(id, |s| s.outputs = Some(Value::Object(output.clone())));
    state.transition(id, BlockStatus::Completed);
    state
        .ctx
        .status
        .emit(StatusUpdate::completed(id, Some(Value::Object(output.clone()))));
    if let Some(checkpoint) = &state.ctx.checkpoint {
        checkpoint(id, BlockStatus::Completed, Some(&Value::Object(output)));
    }
    debug!(block = %id, "block completed");

    // Dependents are reserved before the terminal broadcast so a waiter
    // (the for-each driver) never observes a falsely quiet subgraph.
    dispatch_dependents(state, block);
    state.mark_terminal(id);
    state.reclaim_predecessors(id);
}

/// Failed-block bookkeeping. Dependents are not dispatched: their
/// predecessor check keeps them pending.
fn finish_failed(state: &Arc<RunState>, block: &Block, message: String) {
    let id = &block.id;
    error!(block = %id, error = %message, "block failed");
    state.with_state(id, |s| s.error = Some(message.clone()));
    state.transition(id, BlockStatus::Failed);
    state.ctx.status.emit(StatusUpdate::failed(id, message));
    if let Some(checkpoint) = &state.ctx.checkpoint {
        checkpoint(id, BlockStatus::Failed, None);
    }
    state.mark_terminal(id);
    state.reclaim_predecessors(id);
}

/// Dispatch dependents whose branch gates and predecessors are
/// satisfied; settle branch-dropped dependents to `skipped`.
fn dispatch_dependents(state: &Arc<RunState>, block: &Block) {
    let id = &block.id;

    // A completed for-each dispatches its `done` dependents only — the
    // loop-body side already ran inside the driver's iterations.
    let candidates: Vec<String> = if block.block_type == BlockType::ForEach {
        state.graph.done_dependents(id)
    } else {
        state
            .graph
            .dependents
            .get(id)
            .cloned()
            .unwrap_or_default()
    };

    for dependent in candidates {
        if state.ready_to_dispatch(&dependent) {
            spawn_block(state.clone(), dependent);
        } else if state.dead_by_branch(&dependent)
            && state.status_of(&dependent) == BlockStatus::Pending
            && state.transition(&dependent, BlockStatus::Skipped)
        {
            debug!(block = %dependent, "dependent skipped by branch gate");
            state.mark_terminal(&dependent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::{StaticCatalog, StaticToolRegistry};
    use crate::events::{StatusKind, StatusSender};
    use crate::exec::{BlockExecutor, BoxFut};
    use crate::model::{Connection, Variable};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Deterministic scripted executor for engine scenarios. Behavior
    /// is driven by block config:
    /// - `emit`: value placed under `response` (default `"ok"`)
    /// - `delayMs`: sleep before responding
    /// - `failTimes`: fail with HTTP 500 for the first N attempts
    /// - `failAlways`: fail with the given HTTP status every time
    /// - `panic`: panic with the given message
    /// - `script = "times10"`: emit `{out: item * 10}`
    struct ScriptedExecutor {
        attempts: Mutex<HashMap<String, u32>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                attempts: Mutex::new(HashMap::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }

        fn attempts_for(&self, id: &str) -> u32 {
            self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    impl BlockExecutor for ScriptedExecutor {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn execute<'a>(
            &'a self,
            _ctx: &'a RunContext,
            block: &'a Block,
            inputs: &'a JsonMap,
        ) -> BoxFut<'a, Result<JsonMap>> {
            Box::pin(async move {
                let attempt = {
                    let mut attempts = self.attempts.lock().unwrap();
                    let entry = attempts.entry(block.id.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };

                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_running.fetch_max(now, Ordering::SeqCst);

                if let Some(delay) = block.config_u64("delayMs") {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }

                let result = (|| {
                    if let Some(message) = block.config.get("panic").and_then(Value::as_str) {
                        panic!("{}", message.to_string());
                    }
                    if let Some(status) = block.config_u64("failAlways") {
                        return Err(EngineError::Http {
                            status: status as u16,
                            body: "scripted failure".into(),
                            retry_after: None,
                            output: None,
                        });
                    }
                    if let Some(times) = block.config_u64("failTimes") {
                        if u64::from(attempt) <= times {
                            return Err(EngineError::Http {
                                status: 500,
                                body: "transient".into(),
                                retry_after: None,
                                output: None,
                            });
                        }
                    }

                    let mut out = JsonMap::new();
                    if block.config_str("script") == "times10" {
                        let item = inputs.get("item").and_then(Value::as_i64).unwrap_or(0);
                        out.insert("out".into(), json!(item * 10));
                        out.insert("response".into(), json!(item * 10));
                    } else {
                        let emit = block.config.get("emit").cloned().unwrap_or(json!("ok"));
                        out.insert("response".into(), emit);
                    }
                    Ok(out)
                })();

                self.running.fetch_sub(1, Ordering::SeqCst);
                result
            })
        }
    }

    struct Harness {
        engine: WorkflowEngine,
        exec: Arc<ScriptedExecutor>,
    }

    fn harness_with(config: EngineConfig, status: Option<StatusSender>) -> Harness {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut builder = RunContext::builder(
            Arc::new(StaticToolRegistry::new()),
            Arc::new(StaticCatalog::new()),
        );
        if let Some(status) = status {
            builder = builder.status(status);
        }
        let ctx = builder.build();

        let mut registry = ExecutorRegistry::new();
        registry.register(BlockType::Variable, exec.clone() as Arc<dyn BlockExecutor>);
        registry.register(BlockType::Transform, exec.clone() as Arc<dyn BlockExecutor>);
        registry.register(
            BlockType::IfCondition,
            Arc::new(crate::exec::condition::IfConditionExecutor),
        );

        Harness {
            engine: WorkflowEngine::new(ctx)
                .with_registry(registry)
                .with_config(config),
            exec,
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default(), None)
    }

    fn workflow(blocks: Vec<Block>, connections: Vec<Connection>) -> Workflow {
        Workflow {
            id: "test".into(),
            blocks,
            connections,
            variables: vec![],
            workflow_timeout: None,
            max_parallel_blocks: None,
            workflow_model_id: None,
        }
    }

    fn scripted(id: &str) -> Block {
        Block::new(id, BlockType::Variable)
    }

    // S1 — linear chain.
    #[tokio::test]
    async fn test_linear_chain_completes() {
        let h = harness();
        let wf = workflow(
            vec![scripted("a"), scripted("b"), scripted("c")],
            vec![Connection::new("a", "b"), Connection::new("b", "c")],
        );
        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output["c"]["response"], json!("ok"));
        for id in ["a", "b", "c"] {
            assert_eq!(result.block_states[id].status, BlockStatus::Completed);
        }
    }

    // S2 — diamond DAG: the two middle blocks overlap.
    #[tokio::test]
    async fn test_diamond_runs_parallel_branches() {
        let h = harness();
        let wf = workflow(
            vec![
                scripted("a").with_config("delayMs", json!(10)),
                scripted("b").with_config("delayMs", json!(100)),
                scripted("c").with_config("delayMs", json!(100)),
                scripted("d").with_config("delayMs", json!(10)),
            ],
            vec![
                Connection::new("a", "b"),
                Connection::new("a", "c"),
                Connection::new("b", "d"),
                Connection::new("c", "d"),
            ],
        );

        let started = Instant::now();
        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.block_states.len(), 4);
        // Sequential would be ≥220ms; overlap keeps it well under.
        assert!(elapsed < Duration::from_millis(200), "elapsed {:?}", elapsed);
        assert!(h.exec.max_running.load(Ordering::SeqCst) >= 2);
    }

    // S3 — failure propagation: dependents never execute.
    #[tokio::test]
    async fn test_failed_block_leaves_dependents_pending() {
        let h = harness();
        let wf = workflow(
            vec![
                scripted("a").with_config("failAlways", json!(400)),
                scripted("b"),
            ],
            vec![Connection::new("a", "b")],
        );
        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.block_states["a"].status, BlockStatus::Failed);
        assert_eq!(result.block_states["b"].status, BlockStatus::Pending);
        assert_eq!(h.exec.attempts_for("b"), 0);
        assert!(result.error.unwrap().contains("a:"));
    }

    // S4 — retry then success.
    #[tokio::test]
    async fn test_transient_failures_retried_to_success() {
        let h = harness();
        let mut block = scripted("a").with_config("failTimes", json!(2));
        block.retry = Some(crate::model::RetrySpec {
            max_retries: 3,
            backoff_ms: 1,
            max_backoff_ms: 5,
            retry_on: vec![],
        });
        let wf = workflow(vec![block], vec![]);
        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(h.exec.attempts_for("a"), 3);
        let state = &result.block_states["a"];
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.retry_history.len(), 2);
        assert!(state.retry_history[0].error.contains("500"));
    }

    // Invariant 7 — at most N+1 attempts.
    #[tokio::test]
    async fn test_retry_exhaustion_attempt_bound() {
        let h = harness();
        let mut block = scripted("a").with_config("failTimes", json!(99));
        block.retry = Some(crate::model::RetrySpec {
            max_retries: 2,
            backoff_ms: 1,
            max_backoff_ms: 5,
            retry_on: vec![],
        });
        let wf = workflow(vec![block], vec![]);
        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(h.exec.attempts_for("a"), 3);
    }

    // S5 — circuit breaker short-circuits the third failing block.
    #[tokio::test]
    async fn test_circuit_breaker_short_circuits() {
        let (status, mut rx) = StatusSender::channel();
        let h = harness_with(
            EngineConfig {
                breaker_threshold: 2,
                ..EngineConfig::default()
            },
            Some(status),
        );

        let retry = crate::model::RetrySpec {
            max_retries: 1,
            backoff_ms: 1,
            max_backoff_ms: 5,
            retry_on: vec![],
        };
        let mut a = scripted("a").with_config("failAlways", json!(500));
        let mut b = scripted("b").with_config("failAlways", json!(500));
        let mut c = scripted("c").with_config("failAlways", json!(500));
        a.retry = Some(retry.clone());
        b.retry = Some(retry.clone());
        c.retry = Some(retry);
        // A chain keeps the failure order deterministic... except a
        // failed block never dispatches dependents, so three starts with
        // staggered delays are used instead.
        let b = b.with_config("delayMs", json!(30));
        let c = c.with_config("delayMs", json!(80));
        let wf = workflow(vec![a, b, c], vec![]);

        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);

        // Blocks a and b retried (2 attempts each); c was short-circuited.
        assert_eq!(h.exec.attempts_for("a"), 2);
        assert_eq!(h.exec.attempts_for("b"), 2);
        assert_eq!(h.exec.attempts_for("c"), 1);

        let mut breaker_events = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if update.status == StatusKind::CircuitBreakerTripped {
                breaker_events.push(update.block_id.clone());
            }
        }
        assert_eq!(breaker_events, vec!["c"]);
    }

    // S6 — for-each drives its subgraph once per item, in order.
    #[tokio::test]
    async fn test_foreach_subgraph_iterations() {
        let h = harness();
        let wf = workflow(
            vec![
                scripted("seed").with_config("emit", json!([1, 2, 3])),
                Block::new("each", BlockType::ForEach).with_config("arrayField", json!("response")),
                scripted("body-a"),
                Block::new("body-b", BlockType::Transform).with_config("script", json!("times10")),
                scripted("after"),
            ],
            vec![
                Connection::new("seed", "each"),
                Connection::on_port("each", "body-a", "loop_body"),
                Connection::new("body-a", "body-b"),
                Connection::on_port("each", "after", "done"),
            ],
        );

        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed, "{:?}", result.error);

        let each_output = result.block_states["each"].outputs.as_ref().unwrap();
        let iterations = each_output["iterationResults"].as_array().unwrap();
        assert_eq!(iterations.len(), 3);
        for (i, iteration) in iterations.iter().enumerate() {
            assert_eq!(iteration["_iterationIndex"], json!(i));
            assert_eq!(iteration["out"], json!((i as i64 + 1) * 10));
        }

        // The done block ran exactly once, after all iterations.
        assert_eq!(h.exec.attempts_for("after"), 1);
        // The body ran once per item.
        assert_eq!(h.exec.attempts_for("body-a"), 3);
    }

    // Branch gating: the untaken branch is skipped, not run.
    #[tokio::test]
    async fn test_branch_gating_skips_untaken_path() {
        let h = harness();
        let wf = workflow(
            vec![
                scripted("start").with_config("emit", json!(42)),
                Block::new("check", BlockType::IfCondition)
                    .with_config("field", json!("response"))
                    .with_config("operator", json!("gt"))
                    .with_config("value", json!(10)),
                scripted("when-true"),
                scripted("when-false"),
            ],
            vec![
                Connection::new("start", "check"),
                Connection::on_port("check", "when-true", "true"),
                Connection::on_port("check", "when-false", "false"),
            ],
        );

        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(
            result.block_states["when-true"].status,
            BlockStatus::Completed
        );
        assert_eq!(
            result.block_states["when-false"].status,
            BlockStatus::Skipped
        );
        assert_eq!(h.exec.attempts_for("when-false"), 0);
    }

    // Invariant 4 — a panic still produces a completion signal.
    #[tokio::test]
    async fn test_panic_recovered_as_block_failure() {
        let h = harness();
        let wf = workflow(
            vec![
                scripted("boom").with_config("panic", json!("index out of bounds")),
                scripted("independent"),
            ],
            vec![],
        );
        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(result.block_states["boom"].status, BlockStatus::Failed);
        assert!(result.block_states["boom"]
            .error
            .as_ref()
            .unwrap()
            .contains("internal panic"));
        assert_eq!(
            result.block_states["independent"].status,
            BlockStatus::Completed
        );
    }

    // Invariant 3 — parallelism never exceeds the bound.
    #[tokio::test]
    async fn test_parallelism_bounded_by_semaphore() {
        let h = harness();
        let mut wf = workflow(
            (0..6)
                .map(|i| scripted(&format!("p{}", i)).with_config("delayMs", json!(20)))
                .collect(),
            vec![],
        );
        wf.max_parallel_blocks = Some(2);

        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(h.exec.max_running.load(Ordering::SeqCst) <= 2);
    }

    // Invariant 10 — determinism with deterministic executors.
    #[tokio::test]
    async fn test_deterministic_outputs_across_runs() {
        let wf = workflow(
            vec![
                scripted("a").with_config("emit", json!({"n": 1})),
                scripted("b").with_config("emit", json!("middle")),
                scripted("c").with_config("emit", json!([true, false])),
            ],
            vec![Connection::new("a", "b"), Connection::new("b", "c")],
        );

        let first = harness().engine.execute(&wf, JsonMap::new()).await.unwrap();
        let second = harness().engine.execute(&wf, JsonMap::new()).await.unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.output, second.output);
        let completed = |r: &ExecutionResult| {
            let mut ids: Vec<String> = r
                .block_states
                .iter()
                .filter(|(_, s)| s.status == BlockStatus::Completed)
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            ids
        };
        assert_eq!(completed(&first), completed(&second));
    }

    // Workflow deadline cancels the run.
    #[tokio::test]
    async fn test_workflow_deadline_cancels() {
        let h = harness();
        let mut wf = workflow(
            vec![
                scripted("slow").with_config("delayMs", json!(400)),
                scripted("next"),
            ],
            vec![Connection::new("slow", "next")],
        );
        wf.workflow_timeout = Some(0);

        // A zero-second deadline trips almost immediately; the slow
        // block still finishes its sleep but `next` is not started
        // fresh after cancellation.
        let result = h.engine.execute(&wf, JsonMap::new()).await.unwrap();
        let next = &result.block_states["next"];
        assert_ne!(next.status, BlockStatus::Completed);
    }

    // Variables: defaults applied, caller input wins.
    #[tokio::test]
    async fn test_variable_defaults_and_overrides() {
        let h = harness();
        let mut wf = workflow(vec![scripted("a").with_config("emit", json!("ok"))], vec![]);
        wf.variables = vec![
            Variable {
                name: "city".into(),
                default: Some(json!("Paris")),
            },
            Variable {
                name: "count".into(),
                default: Some(json!(1)),
            },
        ];

        let mut input = JsonMap::new();
        input.insert("count".into(), json!(5));
        let result = h.engine.execute(&wf, input).await.unwrap();

        let inputs = result.block_states["a"].inputs.as_ref().unwrap();
        assert_eq!(inputs["city"], json!("Paris"));
        assert_eq!(inputs["count"], json!(5));
    }

    // Circular workflows are rejected up front.
    #[tokio::test]
    async fn test_circular_dependency_rejected() {
        let h = harness();
        let wf = workflow(
            vec![scripted("a"), scripted("b")],
            vec![Connection::new("a", "b"), Connection::new("b", "a")],
        );
        let err = h.engine.execute(&wf, JsonMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    // Checkpoint sink sees every terminal transition.
    #[tokio::test]
    async fn test_checkpoint_called_per_block() {
        let seen: Arc<Mutex<Vec<(String, BlockStatus)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let exec = Arc::new(ScriptedExecutor::new());
        let mut registry = ExecutorRegistry::new();
        registry.register(BlockType::Variable, exec.clone() as Arc<dyn BlockExecutor>);

        let ctx = RunContext::builder(
            Arc::new(StaticToolRegistry::new()),
            Arc::new(StaticCatalog::new()),
        )
        .checkpoint(Arc::new(move |id, status, _output| {
            sink.lock().unwrap().push((id.to_string(), status));
        }))
        .build();

        let engine = WorkflowEngine::new(ctx).with_registry(registry);
        let wf = workflow(
            vec![scripted("a"), scripted("b").with_config("failAlways", json!(401))],
            vec![],
        );
        engine.execute(&wf, JsonMap::new()).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), BlockStatus::Completed),
                ("b".to_string(), BlockStatus::Failed),
            ]
        );
    }
}
