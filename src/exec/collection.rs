//! Array-shaping blocks: filter, sort, limit, deduplicate, merge, and
//! aggregate.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};

use super::condition::{eval_condition, Condition};
use super::{scope_of, BlockExecutor, BoxFut};
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::model::{Block, JsonMap};
use crate::template;

/// Keys probed for an input array when `arrayField` is not configured.
const ARRAY_PROBE_KEYS: [&str; 6] = ["items", "response", "data", "value", "result", "input"];

/// Resolve the working array for a collection block.
///
/// `arrayField` (optionally `{{wrapped}}`) takes precedence; otherwise
/// the common input keys are probed for the first array. A non-array
/// value is wrapped as a one-element array.
pub(crate) fn resolve_items(block: &Block, inputs: &JsonMap) -> Result<Vec<Value>> {
    let scope = scope_of(inputs);
    let field = block.config_str("arrayField");

    let value = if !field.is_empty() {
        template::resolve_path(&scope, template::strip_placeholder(field)).cloned()
    } else {
        ARRAY_PROBE_KEYS
            .iter()
            .find_map(|k| inputs.get(*k).filter(|v| v.is_array()).cloned())
            .or_else(|| {
                ARRAY_PROBE_KEYS
                    .iter()
                    .find_map(|k| inputs.get(*k).cloned())
            })
    };

    match value {
        Some(Value::Array(items)) => Ok(items),
        Some(Value::Null) | None => Err(EngineError::BlockConfig {
            block: block.id.clone(),
            message: "no input array found".into(),
        }),
        Some(other) => Ok(vec![other]),
    }
}

fn array_output(items: Vec<Value>) -> JsonMap {
    let mut out = JsonMap::new();
    out.insert("count".into(), Value::from(items.len()));
    out.insert("items".into(), Value::Array(items.clone()));
    out.insert("response".into(), Value::Array(items));
    out
}

// ---------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------

/// Keeps (`include`) or drops (`exclude`) items satisfying ALL
/// configured conditions.
pub struct FilterExecutor;

impl BlockExecutor for FilterExecutor {
    fn kind(&self) -> &'static str {
        "filter"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let items = resolve_items(block, inputs)?;
            let conditions: Vec<Condition> = block
                .config
                .get("conditions")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            let exclude = block.config_str("mode") == "exclude";

            let kept: Vec<Value> = items
                .into_iter()
                .filter(|item| {
                    let satisfies_all = conditions.iter().all(|c| eval_condition(c, item));
                    satisfies_all != exclude
                })
                .collect();

            Ok(array_output(kept))
        })
    }
}

// ---------------------------------------------------------------------
// Sort
// ---------------------------------------------------------------------

/// Stable multi-key sort with per-key direction and type.
pub struct SortExecutor;

#[derive(Debug, serde::Deserialize)]
struct SortKey {
    field: String,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default, rename = "type")]
    value_type: Option<String>,
}

impl BlockExecutor for SortExecutor {
    fn kind(&self) -> &'static str {
        "sort"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let mut items = resolve_items(block, inputs)?;
            let keys: Vec<SortKey> = block
                .config
                .get("keys")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            if keys.is_empty() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: "sort requires at least one key".into(),
                });
            }

            items.sort_by(|a, b| {
                for key in &keys {
                    let left = template::resolve_path(a, &key.field);
                    let right = template::resolve_path(b, &key.field);
                    let value_type = key.value_type.as_deref().unwrap_or("auto");
                    let mut ord = compare_typed(left, right, value_type);
                    if key.direction.as_deref() == Some("desc") {
                        ord = ord.reverse();
                    }
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });

            Ok(array_output(items))
        })
    }
}

/// Compare two optional values under a sort type. Missing values sort
/// last regardless of direction of the individual comparison.
fn compare_typed(a: Option<&Value>, b: Option<&Value>, value_type: &str) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match value_type {
            "number" => num_of(a)
                .partial_cmp(&num_of(b))
                .unwrap_or(Ordering::Equal),
            "date" => date_of(a).cmp(&date_of(b)),
            "string" => text_of(a).cmp(&text_of(b)),
            _ => auto_compare(a, b),
        },
    }
}

fn auto_compare(a: &Value, b: &Value) -> Ordering {
    if let (Some(x), Some(y)) = (try_num(a), try_num(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    if let (Some(x), Some(y)) = (try_date(a), try_date(b)) {
        return x.cmp(&y);
    }
    text_of(a).cmp(&text_of(b))
}

fn try_num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn num_of(v: &Value) -> f64 {
    try_num(v).unwrap_or(0.0)
}

fn text_of(v: &Value) -> String {
    template::display_value(v)
}

/// Parse a date value, trying RFC3339, ISO date, US date, and textual
/// month forms. Returns epoch milliseconds; unparseable values sort
/// first as 0.
fn try_date(v: &Value) -> Option<i64> {
    let s = v.as_str()?;
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, format) {
            return d
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp_millis());
        }
    }
    None
}

fn date_of(v: &Value) -> i64 {
    try_date(v).unwrap_or(0)
}

// ---------------------------------------------------------------------
// Limit
// ---------------------------------------------------------------------

/// Take the first or last N items with an offset, clamped at bounds.
pub struct LimitExecutor;

impl BlockExecutor for LimitExecutor {
    fn kind(&self) -> &'static str {
        "limit"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let items = resolve_items(block, inputs)?;
            let count = block.config_u64("count").unwrap_or(10) as usize;
            let offset = block.config_u64("offset").unwrap_or(0) as usize;
            let from_last = block.config_str("from") == "last";

            let len = items.len();
            let taken: Vec<Value> = if from_last {
                // Window counted from the tail, order preserved.
                let end = len.saturating_sub(offset.min(len));
                let start = end.saturating_sub(count);
                items[start..end].to_vec()
            } else {
                let start = offset.min(len);
                let end = (start + count).min(len);
                items[start..end].to_vec()
            };

            Ok(array_output(taken))
        })
    }
}

// ---------------------------------------------------------------------
// Deduplicate
// ---------------------------------------------------------------------

/// Keep the first or last occurrence per key.
pub struct DeduplicateExecutor;

impl BlockExecutor for DeduplicateExecutor {
    fn kind(&self) -> &'static str {
        "deduplicate"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let items = resolve_items(block, inputs)?;
            let key_field = block.config_str("keyField");
            let keep_last = block.config_str("keep") == "last";

            let key_of = |item: &Value| -> String {
                if key_field.is_empty() {
                    item.to_string()
                } else {
                    template::resolve_path(item, key_field)
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                }
            };

            let deduped = if keep_last {
                let mut seen = HashSet::new();
                let mut reversed: Vec<Value> = items
                    .into_iter()
                    .rev()
                    .filter(|item| seen.insert(key_of(item)))
                    .collect();
                reversed.reverse();
                reversed
            } else {
                let mut seen = HashSet::new();
                items
                    .into_iter()
                    .filter(|item| seen.insert(key_of(item)))
                    .collect()
            };

            Ok(array_output(deduped))
        })
    }
}

// ---------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------

/// Combine values from multiple upstream sources.
///
/// Modes: `append` concatenates arrays; `merge_by_key` joins objects on
/// a shared key preserving first-seen order; `combine_all` builds one
/// object keyed by source name.
pub struct MergeExecutor;

impl BlockExecutor for MergeExecutor {
    fn kind(&self) -> &'static str {
        "merge"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let mode = match block.config_str("mode") {
                "" => "append",
                m => m,
            };
            let sources: Vec<String> = block
                .config
                .get("sources")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            if sources.is_empty() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: "merge requires a sources list".into(),
                });
            }

            let scope = scope_of(inputs);
            let resolved: Vec<(String, Value)> = sources
                .iter()
                .map(|s| {
                    let v = template::resolve_path(&scope, template::strip_placeholder(s))
                        .cloned()
                        .unwrap_or(Value::Null);
                    (s.clone(), v)
                })
                .collect();

            let merged = match mode {
                "append" => {
                    let mut all = Vec::new();
                    for (_, v) in resolved {
                        match v {
                            Value::Array(items) => all.extend(items),
                            Value::Null => {}
                            other => all.push(other),
                        }
                    }
                    Value::Array(all)
                }
                "merge_by_key" => {
                    let key = block.config_str("key");
                    if key.is_empty() {
                        return Err(EngineError::BlockConfig {
                            block: block.id.clone(),
                            message: "merge_by_key requires a key".into(),
                        });
                    }
                    merge_by_key(resolved, key)
                }
                "combine_all" => {
                    let mut map = Map::new();
                    for (name, v) in resolved {
                        map.insert(name, v);
                    }
                    Value::Object(map)
                }
                other => {
                    return Err(EngineError::BlockConfig {
                        block: block.id.clone(),
                        message: format!("unknown merge mode '{}'", other),
                    })
                }
            };

            let mut out = JsonMap::new();
            if let Value::Array(items) = &merged {
                out.insert("count".into(), Value::from(items.len()));
                out.insert("items".into(), merged.clone());
            }
            out.insert("response".into(), merged.clone());
            out.insert("result".into(), merged);
            Ok(out)
        })
    }
}

/// Join object items from every source on a shared key, merging later
/// occurrences into the first and preserving first-seen order.
fn merge_by_key(sources: Vec<(String, Value)>, key: &str) -> Value {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: std::collections::HashMap<String, Map<String, Value>> =
        std::collections::HashMap::new();

    for (_, source) in sources {
        let items = match source {
            Value::Array(items) => items,
            Value::Object(_) => vec![source],
            _ => continue,
        };
        for item in items {
            let Value::Object(obj) = item else { continue };
            let Some(key_value) = obj.get(key).map(|v| v.to_string()) else {
                continue;
            };
            match by_key.get_mut(&key_value) {
                Some(existing) => {
                    for (k, v) in obj {
                        existing.entry(k).or_insert(v);
                    }
                }
                None => {
                    order.push(key_value.clone());
                    by_key.insert(key_value, obj);
                }
            }
        }
    }

    Value::Array(
        order
            .into_iter()
            .filter_map(|k| by_key.remove(&k).map(Value::Object))
            .collect(),
    )
}

// ---------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------

/// Numeric and collecting aggregations with optional grouping.
pub struct AggregateExecutor;

impl BlockExecutor for AggregateExecutor {
    fn kind(&self) -> &'static str {
        "aggregate"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let items = resolve_items(block, inputs)?;
            let operation = block.config_str("operation");
            if operation.is_empty() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: "operation is required".into(),
                });
            }
            let field = block.config_str("field");
            let group_by = block.config_str("groupBy");
            let separator = match block.config_str("separator") {
                "" => ", ",
                s => s,
            };

            let result = if group_by.is_empty() {
                aggregate(&items, operation, field, separator).ok_or_else(|| {
                    EngineError::BlockConfig {
                        block: block.id.clone(),
                        message: format!("unknown aggregate operation '{}'", operation),
                    }
                })?
            } else {
                let mut order: Vec<String> = Vec::new();
                let mut groups: std::collections::HashMap<String, Vec<Value>> =
                    std::collections::HashMap::new();
                for item in &items {
                    let group = template::resolve_path(item, group_by)
                        .map(template::display_value)
                        .unwrap_or_default();
                    if !groups.contains_key(&group) {
                        order.push(group.clone());
                    }
                    groups.entry(group).or_default().push(item.clone());
                }
                let mut out = Map::new();
                for group in order {
                    let members = &groups[&group];
                    let value =
                        aggregate(members, operation, field, separator).ok_or_else(|| {
                            EngineError::BlockConfig {
                                block: block.id.clone(),
                                message: format!("unknown aggregate operation '{}'", operation),
                            }
                        })?;
                    out.insert(group, value);
                }
                Value::Object(out)
            };

            let mut out = JsonMap::new();
            out.insert("response".into(), result.clone());
            out.insert("result".into(), result);
            out.insert("count".into(), Value::from(items.len()));
            Ok(out)
        })
    }
}

/// Field extractor: empty field means the item itself.
fn field_value<'a>(item: &'a Value, field: &str) -> Option<&'a Value> {
    if field.is_empty() {
        Some(item)
    } else {
        template::resolve_path(item, field)
    }
}

/// Apply one aggregate operation. Numeric operations coerce non-numeric
/// values to 0.
fn aggregate(items: &[Value], operation: &str, field: &str, separator: &str) -> Option<Value> {
    let values: Vec<Value> = items
        .iter()
        .filter_map(|item| field_value(item, field).cloned())
        .collect();
    let numbers = || values.iter().map(num_of);

    let result = match operation {
        "count" => Value::from(items.len()),
        "sum" => json_num(numbers().sum()),
        "avg" => {
            if values.is_empty() {
                Value::from(0)
            } else {
                json_num(numbers().sum::<f64>() / values.len() as f64)
            }
        }
        "min" => json_num(numbers().fold(f64::INFINITY, f64::min)),
        "max" => json_num(numbers().fold(f64::NEG_INFINITY, f64::max)),
        "first" => values.first().cloned().unwrap_or(Value::Null),
        "last" => values.last().cloned().unwrap_or(Value::Null),
        "concat" => Value::String(
            values
                .iter()
                .map(text_of)
                .collect::<Vec<_>>()
                .join(separator),
        ),
        "collect" => Value::Array(values),
        _ => return None,
    };
    Some(result)
}

/// Prefer integer JSON numbers when the float is whole.
fn json_num(f: f64) -> Value {
    if !f.is_finite() {
        return Value::from(0);
    }
    if f.fract() == 0.0 && f.abs() < 1e15 {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::from(0))
    }
}
