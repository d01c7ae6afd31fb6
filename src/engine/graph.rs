//! Dependency graph construction, pre-flight template validation, and
//! for-each subgraph computation.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::model::{normalize_id, Connection, Workflow, RESERVED_KEYS};

/// Precomputed adjacency for one workflow.
#[derive(Debug, Default)]
pub struct Graph {
    /// target → source block ids.
    pub predecessors: HashMap<String, Vec<String>>,
    /// source → target block ids.
    pub dependents: HashMap<String, Vec<String>>,
    /// source → outgoing connections (for port-aware routing).
    pub connections_from: HashMap<String, Vec<Connection>>,
    /// target → incoming connections (for branch-gate checks).
    pub connections_to: HashMap<String, Vec<Connection>>,
    /// Blocks with no predecessors.
    pub start_blocks: Vec<String>,
}

impl Graph {
    pub fn build(workflow: &Workflow) -> Self {
        let mut graph = Graph::default();
        for conn in &workflow.connections {
            graph
                .predecessors
                .entry(conn.target.clone())
                .or_default()
                .push(conn.source.clone());
            graph
                .dependents
                .entry(conn.source.clone())
                .or_default()
                .push(conn.target.clone());
            graph
                .connections_from
                .entry(conn.source.clone())
                .or_default()
                .push(conn.clone());
            graph
                .connections_to
                .entry(conn.target.clone())
                .or_default()
                .push(conn.clone());
        }
        graph.start_blocks = workflow
            .blocks
            .iter()
            .filter(|b| !graph.predecessors.contains_key(&b.id))
            .map(|b| b.id.clone())
            .collect();
        graph
    }

    /// Direct dependents riding the `loop_body` port (the default port
    /// counts as loop-body on a for-each).
    pub fn loop_body_dependents(&self, foreach_id: &str) -> Vec<String> {
        self.connections_from
            .get(foreach_id)
            .map(|conns| {
                conns
                    .iter()
                    .filter(|c| c.source_output == "loop_body" || c.is_default_port())
                    .map(|c| c.target.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents riding the `done` port.
    pub fn done_dependents(&self, foreach_id: &str) -> Vec<String> {
        self.connections_from
            .get(foreach_id)
            .map(|conns| {
                conns
                    .iter()
                    .filter(|c| c.source_output == "done")
                    .map(|c| c.target.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The loop-body subgraph: every block reachable downstream from the
    /// for-each's loop-body dependents, stopping at (and excluding) its
    /// `done` dependents and the for-each itself.
    pub fn loop_subgraph(&self, foreach_id: &str) -> HashSet<String> {
        let stop: HashSet<String> = self.done_dependents(foreach_id).into_iter().collect();
        let mut subgraph = HashSet::new();
        let mut queue: VecDeque<String> = self.loop_body_dependents(foreach_id).into();

        while let Some(id) = queue.pop_front() {
            if id == foreach_id || stop.contains(&id) || !subgraph.insert(id.clone()) {
                continue;
            }
            if let Some(next) = self.dependents.get(&id) {
                queue.extend(next.iter().cloned());
            }
        }
        subgraph
    }
}

/// Pre-flight template-reference check: scan every block config for
/// `{{top.rest}}` and report placeholders whose first segment is not a
/// known block id, normalized id, workflow variable, or runtime-reserved
/// key.
pub fn preflight_warnings(workflow: &Workflow) -> Vec<String> {
    let mut known: HashSet<String> = RESERVED_KEYS.iter().map(|k| k.to_string()).collect();
    for block in &workflow.blocks {
        known.insert(block.id.clone());
        known.insert(normalize_id(&block.id));
    }
    for var in &workflow.variables {
        known.insert(var.name.clone());
    }

    let mut warnings = Vec::new();
    for block in &workflow.blocks {
        let mut tops = Vec::new();
        collect_placeholder_tops(&Value::Object(block.config.clone()), &mut tops);
        for top in tops {
            if !known.contains(&top) {
                warnings.push(format!(
                    "block '{}' references '{{{{{}…}}}}' but '{}' is not a known block, \
                     variable, or runtime key",
                    block.id, top, top
                ));
            }
        }
    }
    warnings
}

/// First path segment of every `{{…}}` placeholder in a config value.
fn collect_placeholder_tops(value: &Value, tops: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("{{") {
                let after = &rest[start + 2..];
                let Some(end) = after.find("}}") else { break };
                let path = after[..end].trim();
                let top = path
                    .split(['.', '['])
                    .next()
                    .unwrap_or(path)
                    .trim()
                    .to_string();
                if !top.is_empty() {
                    tops.push(top);
                }
                rest = &after[end + 2..];
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_placeholder_tops(v, tops);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_placeholder_tops(item, tops);
            }
        }
        _ => {}
    }
}
