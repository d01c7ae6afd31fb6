//! The for-each driver: iterate an array, re-entering the loop-body
//! subgraph once per item with a full state reset in between.
//!
//! Iterations are strictly sequential — the driver waits for the whole
//! subgraph to settle before resetting it for the next item. Blocks
//! inside one iteration still run in parallel under the run's
//! semaphore.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::run::{RunState, WILDCARD_BRANCH};
use crate::error::Result;
use crate::events::StatusUpdate;
use crate::exec::collection::resolve_items;
use crate::model::{Block, JsonMap};

/// Default iteration cap.
const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Drive a for-each block to completion, returning its final output.
pub(super) async fn drive(
    state: &Arc<RunState>,
    block: &Block,
    inputs: &JsonMap,
) -> Result<JsonMap> {
    let items = resolve_items(block, inputs)?;
    let item_variable = match block.config_str("itemVariable") {
        "" => "item",
        name => name,
    };
    let max_iterations = block
        .config_u64("maxIterations")
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_ITERATIONS);
    let total = items.len().min(max_iterations);
    if total < items.len() {
        warn!(
            block = %block.id,
            items = items.len(),
            cap = max_iterations,
            "for-each input exceeds iteration cap, truncating"
        );
    }

    let subgraph = state.graph.loop_subgraph(&block.id);
    let loop_dependents = state.graph.loop_body_dependents(&block.id);
    let mut iteration_results: Vec<Value> = Vec::new();

    if !loop_dependents.is_empty() && !subgraph.is_empty() {
        state.set_loop_active(&block.id, "loop_body", subgraph.clone());

        for (index, item) in items.iter().take(total).enumerate() {
            if let Err(e) = state.ctx.check_cancelled() {
                state.clear_loop_active(&block.id);
                return Err(e);
            }
            debug!(block = %block.id, index, "for-each iteration start");

            // The iteration view downstream blocks resolve against.
            let mut view = JsonMap::new();
            view.insert("response".into(), item.clone());
            view.insert("item".into(), item.clone());
            if item_variable != "item" {
                view.insert(item_variable.to_string(), item.clone());
            }
            view.insert("index".into(), json!(index));
            view.insert("totalItems".into(), json!(items.len()));
            view.insert("branch".into(), json!("loop_body"));
            state.set_output(&block.id, view);

            reset_subgraph(state, &subgraph);

            state
                .ctx
                .status
                .emit(StatusUpdate::running(&block.id, Some(json!({"index": index}))));

            for dependent in &loop_dependents {
                if state.ready_to_dispatch(dependent) {
                    super::spawn_block(state.clone(), dependent.clone());
                }
            }

            state.wait_subgraph_quiet(&subgraph).await;

            iteration_results.push(collect_iteration_result(state, &subgraph, index));
        }

        state.clear_loop_active(&block.id);
    }

    // Final output: the full array plus per-iteration results; the
    // wildcard branch lets both loop_body and done edges route.
    let mut output = JsonMap::new();
    output.insert("items".into(), Value::Array(items.clone()));
    output.insert("totalItems".into(), json!(items.len()));
    output.insert(
        "iterationResults".into(),
        Value::Array(iteration_results.clone()),
    );
    output.insert("response".into(), Value::Array(iteration_results));
    output.insert("branch".into(), json!(WILDCARD_BRANCH));
    Ok(output)
}

/// Reset every subgraph block to `pending`, clearing outputs, state,
/// and dispatch records.
fn reset_subgraph(state: &Arc<RunState>, subgraph: &HashSet<String>) {
    state.clear_completion(subgraph);
    {
        let mut states = state.states.write().expect("state lock");
        for id in subgraph {
            if let Some(block_state) = states.get_mut(id) {
                block_state.reset_for_iteration();
            }
        }
    }
    let mut outputs = state.outputs.write().expect("output lock");
    for id in subgraph {
        outputs.remove(id);
    }
}

/// Collect the iteration's result from the subgraph leaves (blocks with
/// no downstream inside the subgraph), tagged with the iteration index.
fn collect_iteration_result(
    state: &Arc<RunState>,
    subgraph: &HashSet<String>,
    index: usize,
) -> Value {
    let mut leaves: Vec<&String> = subgraph
        .iter()
        .filter(|id| {
            state
                .graph
                .dependents
                .get(*id)
                .map(|deps| deps.iter().all(|d| !subgraph.contains(d)))
                .unwrap_or(true)
        })
        .collect();
    leaves.sort();

    let completed: Vec<(&String, JsonMap)> = leaves
        .iter()
        .filter_map(|id| state.output_of(id).map(|o| (*id, o)))
        .collect();

    let mut result = match completed.len() {
        0 => Map::new(),
        1 => completed.into_iter().next().expect("len checked").1,
        _ => {
            let mut merged = Map::new();
            for (id, output) in completed {
                merged.insert(id.clone(), Value::Object(output));
            }
            merged
        }
    };
    result.insert("_iterationIndex".into(), json!(index));
    Value::Object(result)
}
