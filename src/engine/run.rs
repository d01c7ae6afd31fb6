//! Shared per-run state: block states and outputs behind one RW lock,
//! the completion set and its condition, input projection, branch
//! gating, and memory reclamation.
//!
//! Locking discipline: the state lock is never held across an executor
//! call or any await; the completion lock is always acquired after the
//! state lock has been released.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

use super::graph::Graph;
use super::EngineConfig;
use crate::context::RunContext;
use crate::exec::ExecutorRegistry;
use crate::model::{normalize_id, Block, BlockState, BlockStatus, JsonMap};

use std::sync::Arc;

/// Upstream keys flattened into a dependent's inputs from its directly
/// connected predecessors, enabling `{{response}}` shorthand.
const ESSENTIAL_KEYS: [&str; 10] = [
    "response",
    "data",
    "output",
    "value",
    "result",
    "artifacts",
    "toolResults",
    "items",
    "text",
    "files",
];

/// Wildcard branch value matching every port.
pub const WILDCARD_BRANCH: &str = "*";

/// A for-each block mid-iteration.
#[derive(Debug, Clone)]
pub(crate) struct ActiveLoop {
    /// Branch its outgoing edges currently satisfy (`loop_body`).
    pub branch: String,
    /// The loop-body subgraph, for iteration-view flattening.
    pub subgraph: HashSet<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Completion {
    /// Blocks handed to a task (deduplicates dispatch).
    pub dispatched: HashSet<String>,
    /// Blocks in a terminal state.
    pub terminal: HashSet<String>,
    /// Live block tasks.
    pub in_flight: usize,
}

/// All state shared between the dispatcher, block tasks, and the
/// for-each driver for one run.
pub(crate) struct RunState {
    pub blocks: HashMap<String, Block>,
    pub graph: Graph,
    /// Workflow variables ∪ caller input; immutable once the run starts.
    pub globals: JsonMap,
    pub states: RwLock<HashMap<String, BlockState>>,
    pub outputs: RwLock<HashMap<String, JsonMap>>,
    completion: Mutex<Completion>,
    /// For-each blocks mid-iteration. Readiness checks treat them as
    /// completed on their registered branch, and their iteration view
    /// (`item`, `index`, …) is flattened into subgraph inputs.
    active_loops: Mutex<HashMap<String, ActiveLoop>>,
    notify: Notify,
    pub semaphore: Semaphore,
    pub ctx: RunContext,
    pub registry: Arc<ExecutorRegistry>,
    pub config: EngineConfig,
}

impl RunState {
    pub fn new(
        blocks: HashMap<String, Block>,
        graph: Graph,
        globals: JsonMap,
        ctx: RunContext,
        registry: Arc<ExecutorRegistry>,
        config: EngineConfig,
        max_parallel: usize,
    ) -> Self {
        let states = blocks
            .keys()
            .map(|id| (id.clone(), BlockState::new()))
            .collect();
        Self {
            blocks,
            graph,
            globals,
            states: RwLock::new(states),
            outputs: RwLock::new(HashMap::new()),
            completion: Mutex::new(Completion::default()),
            active_loops: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            semaphore: Semaphore::new(max_parallel.max(1)),
            ctx,
            registry,
            config,
        }
    }

    // -- block state ---------------------------------------------------

    pub fn status_of(&self, id: &str) -> BlockStatus {
        self.states
            .read()
            .expect("state lock")
            .get(id)
            .map(|s| s.status)
            .unwrap_or(BlockStatus::Pending)
    }

    /// Attempt a transition through the state machine.
    pub fn transition(&self, id: &str, to: BlockStatus) -> bool {
        let mut states = self.states.write().expect("state lock");
        states
            .get_mut(id)
            .map(|state| state.transition(id, to))
            .unwrap_or(false)
    }

    /// Mutate one block's state record under the write lock.
    pub fn with_state(&self, id: &str, f: impl FnOnce(&mut BlockState)) {
        let mut states = self.states.write().expect("state lock");
        if let Some(state) = states.get_mut(id) {
            f(state);
        }
    }

    pub fn set_output(&self, id: &str, output: JsonMap) {
        self.outputs
            .write()
            .expect("output lock")
            .insert(id.to_string(), output);
    }

    pub fn output_of(&self, id: &str) -> Option<JsonMap> {
        self.outputs.read().expect("output lock").get(id).cloned()
    }

    // -- completion tracking -------------------------------------------

    /// Reserve dispatch of a block. Returns `false` when it was already
    /// dispatched (or is mid-flight) — callers must then skip spawning.
    pub fn reserve_dispatch(&self, id: &str) -> bool {
        let mut completion = self.completion.lock().expect("completion lock");
        if !completion.dispatched.insert(id.to_string()) {
            return false;
        }
        completion.in_flight += 1;
        true
    }

    /// A block task finished (terminal or aborted).
    pub fn task_finished(&self) {
        let mut completion = self.completion.lock().expect("completion lock");
        completion.in_flight = completion.in_flight.saturating_sub(1);
        drop(completion);
        self.notify.notify_waiters();
    }

    /// Mark a block terminal and wake all waiters.
    pub fn mark_terminal(&self, id: &str) {
        let mut completion = self.completion.lock().expect("completion lock");
        completion.terminal.insert(id.to_string());
        drop(completion);
        self.notify.notify_waiters();
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.completion
            .lock()
            .expect("completion lock")
            .terminal
            .contains(id)
    }

    /// Forget dispatch/terminal records for a set of blocks (for-each
    /// iteration reset).
    pub fn clear_completion(&self, ids: &HashSet<String>) {
        let mut completion = self.completion.lock().expect("completion lock");
        for id in ids {
            completion.dispatched.remove(id);
            completion.terminal.remove(id);
        }
    }

    /// Wait until a predicate over the completion set holds.
    pub async fn wait_until(&self, mut predicate: impl FnMut(&Completion) -> bool) {
        loop {
            let notified = self.notify.notified();
            {
                let completion = self.completion.lock().expect("completion lock");
                if predicate(&completion) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Wait for every spawned task to finish.
    pub async fn wait_idle(&self) {
        self.wait_until(|c| c.in_flight == 0).await;
    }

    /// Wait until no subgraph block is mid-flight (dispatched but not
    /// terminal). Blocks that were never dispatched (unreachable this
    /// iteration) do not hold the wait.
    pub async fn wait_subgraph_quiet(&self, subgraph: &HashSet<String>) {
        self.wait_until(|c| {
            subgraph
                .iter()
                .all(|id| !c.dispatched.contains(id) || c.terminal.contains(id))
        })
        .await;
    }

    // -- input projection ----------------------------------------------

    /// Build a block's inputs: globals, every stored block output keyed
    /// by id and normalized id, and essential keys flattened from the
    /// directly connected predecessors.
    pub fn build_inputs(&self, id: &str) -> JsonMap {
        let mut inputs = self.globals.clone();
        // Loop snapshot before the outputs lock: one acquisition order
        // everywhere.
        let loops: Vec<(String, ActiveLoop)> = self
            .active_loops
            .lock()
            .expect("loop lock")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let outputs = self.outputs.read().expect("output lock");

        for (block_id, output) in outputs.iter() {
            let projection = Value::Object(compact_projection(output));
            inputs.insert(block_id.clone(), projection.clone());
            let normalized = normalize_id(block_id);
            if normalized != *block_id {
                inputs.entry(normalized).or_insert(projection);
            }
        }

        if let Some(predecessors) = self.graph.predecessors.get(id) {
            for pred in predecessors {
                let Some(output) = outputs.get(pred) else { continue };
                for key in ESSENTIAL_KEYS {
                    if let Some(value) = output.get(key) {
                        inputs
                            .entry(key.to_string())
                            .or_insert_with(|| value.clone());
                    }
                }
            }
        }

        // Blocks inside an active for-each subgraph see the iteration
        // view (`item`, `index`, the item variable) as top-level keys.
        for (loop_id, active) in &loops {
            if !active.subgraph.contains(id) {
                continue;
            }
            let Some(view) = outputs.get(loop_id) else { continue };
            for (key, value) in view {
                if key == "branch" || key == "response" {
                    continue;
                }
                inputs.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        inputs
    }

    // -- branch gating and readiness -----------------------------------

    /// The branch a stored output routes on, if any.
    pub fn branch_of(&self, id: &str) -> Option<String> {
        self.outputs
            .read()
            .expect("output lock")
            .get(id)
            .and_then(|o| o.get("branch"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    }

    /// Register a for-each block as mid-iteration: its outgoing edges
    /// behave as if it had completed with `branch`, and its iteration
    /// view flows into subgraph inputs.
    pub fn set_loop_active(&self, id: &str, branch: &str, subgraph: HashSet<String>) {
        self.active_loops.lock().expect("loop lock").insert(
            id.to_string(),
            ActiveLoop {
                branch: branch.to_string(),
                subgraph,
            },
        );
    }

    /// Drop a for-each's mid-iteration assumption.
    pub fn clear_loop_active(&self, id: &str) {
        self.active_loops.lock().expect("loop lock").remove(id);
    }

    /// Whether a dependent is ready: every incoming connection has a
    /// completed source whose branch satisfies the edge's gate. A
    /// mid-iteration for-each source counts as completed with its
    /// registered branch.
    pub fn ready_to_dispatch(&self, dep: &str) -> bool {
        let Some(incoming) = self.graph.connections_to.get(dep) else {
            return false;
        };
        let loops = self.active_loops.lock().expect("loop lock").clone();
        incoming.iter().all(|conn| {
            let (status, branch) = match loops.get(&conn.source) {
                Some(active) => (BlockStatus::Completed, Some(active.branch.clone())),
                None => (self.status_of(&conn.source), self.branch_of(&conn.source)),
            };
            status == BlockStatus::Completed && gate_matches(&conn.source_output, branch.as_deref())
        })
    }

    /// Whether a dependent can never run: all sources terminal, but at
    /// least one is not completed-with-matching-branch.
    ///
    /// Failure and gate mismatch differ on purpose: a failed
    /// predecessor leaves the dependent `pending` (failure propagation),
    /// while a completed predecessor whose branch went elsewhere marks
    /// it `skipped`.
    pub fn dead_by_branch(&self, dep: &str) -> bool {
        let Some(incoming) = self.graph.connections_to.get(dep) else {
            return false;
        };
        let all_terminal = incoming
            .iter()
            .all(|conn| self.status_of(&conn.source).is_terminal());
        if !all_terminal {
            return false;
        }
        let all_sources_completed = incoming
            .iter()
            .all(|conn| self.status_of(&conn.source) == BlockStatus::Completed);
        if !all_sources_completed {
            // A failed or skipped source: stays pending, not skipped.
            return false;
        }
        incoming.iter().any(|conn| {
            !gate_matches(&conn.source_output, self.branch_of(&conn.source).as_deref())
        })
    }

    // -- memory reclamation --------------------------------------------

    /// Free the outputs of `id`'s predecessors whose consumers have all
    /// finished. Terminal blocks (no dependents) are kept — they feed
    /// the final run output — and so is the iteration view of a
    /// for-each that is still mid-loop.
    pub fn reclaim_predecessors(&self, id: &str) {
        let Some(predecessors) = self.graph.predecessors.get(id) else {
            return;
        };
        // Snapshot first: the loop lock is never held alongside the
        // outputs lock (build_inputs acquires them in the other order).
        let active: HashSet<String> = self
            .active_loops
            .lock()
            .expect("loop lock")
            .keys()
            .cloned()
            .collect();
        for pred in predecessors {
            if active.contains(pred) {
                continue;
            }
            let Some(consumers) = self.graph.dependents.get(pred) else {
                continue;
            };
            if consumers.is_empty() {
                continue;
            }
            let all_done = consumers.iter().all(|c| self.is_terminal(c));
            if all_done {
                debug!(block = %pred, "reclaiming output, all consumers finished");
                self.outputs.write().expect("output lock").remove(pred);
            }
        }
    }
}

/// A block output with engine-internal fields stripped.
fn compact_projection(output: &JsonMap) -> JsonMap {
    output
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Does a branch value satisfy a connection's port gate?
///
/// Default ports always pass. Named ports require the branch to match
/// exactly, or the wildcard `"*"` (emitted by for-each completion).
pub fn gate_matches(port: &str, branch: Option<&str>) -> bool {
    if port.is_empty() || port == "output" {
        return true;
    }
    match branch {
        Some(WILDCARD_BRANCH) => true,
        Some(branch) => branch == port,
        None => false,
    }
}
