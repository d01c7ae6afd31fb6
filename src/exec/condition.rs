//! If-condition and switch blocks, plus the shared condition evaluator
//! used by the filter block.

use serde::Deserialize;
use serde_json::Value;

use super::{scope_of, BlockExecutor, BoxFut};
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::model::{Block, JsonMap};
use crate::template;

/// One `field operator value` predicate.
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    /// Dotted path resolved against the evaluation scope.
    pub field: String,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

fn default_operator() -> String {
    "eq".to_string()
}

/// Evaluate a condition against a scope.
///
/// Missing fields resolve to `Null`, which satisfies only
/// `is_empty`/`neq`-style checks.
pub fn eval_condition(cond: &Condition, scope: &Value) -> bool {
    let field = template::strip_placeholder(&cond.field);
    let actual = template::resolve_path(scope, field)
        .cloned()
        .unwrap_or(Value::Null);
    let expected = &cond.value;

    match cond.operator.as_str() {
        "eq" => loose_eq(&actual, expected),
        "neq" => !loose_eq(&actual, expected),
        "contains" => contains(&actual, expected),
        "not_contains" => !contains(&actual, expected),
        "gt" => compare(&actual, expected).map(|o| o.is_gt()).unwrap_or(false),
        "lt" => compare(&actual, expected).map(|o| o.is_lt()).unwrap_or(false),
        "gte" => compare(&actual, expected).map(|o| o.is_ge()).unwrap_or(false),
        "lte" => compare(&actual, expected).map(|o| o.is_le()).unwrap_or(false),
        "is_empty" => is_empty(&actual),
        "not_empty" => !is_empty(&actual),
        "is_true" => truthy(&actual),
        "is_false" => !truthy(&actual),
        "starts_with" => as_text(&actual).starts_with(&as_text(expected)),
        "ends_with" => as_text(&actual).ends_with(&as_text(expected)),
        _ => false,
    }
}

/// Equality with numeric coercion: `"5"` equals `5`.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => as_text(a) == as_text(b),
    }
}

/// String containment, or array membership when the actual value is an
/// array.
fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        _ => as_text(actual).contains(&as_text(expected)),
    }
}

/// Ordering with numeric preference, falling back to lexicographic.
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(as_text(a).cmp(&as_text(b))),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_text(v: &Value) -> String {
    template::display_value(v)
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

/// If-condition block: evaluates one predicate and emits `branch` so
/// the engine can gate `true`/`false` connections.
pub struct IfConditionExecutor;

impl BlockExecutor for IfConditionExecutor {
    fn kind(&self) -> &'static str {
        "if_condition"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let field = block.config_str("field");
            if field.is_empty() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: "field is required".into(),
                });
            }
            let cond = Condition {
                field: field.to_string(),
                operator: match block.config_str("operator") {
                    "" => "eq".to_string(),
                    op => op.to_string(),
                },
                value: block.config.get("value").cloned().unwrap_or(Value::Null),
            };
            let matched = eval_condition(&cond, &scope_of(inputs));

            let mut out = JsonMap::new();
            out.insert(
                "branch".into(),
                Value::String(if matched { "true" } else { "false" }.into()),
            );
            out.insert("response".into(), Value::Bool(matched));
            out.insert("result".into(), Value::Bool(matched));
            Ok(out)
        })
    }
}

/// Switch block: first-match wins over an ordered case list; `branch`
/// equals the matched case label or `"default"`.
pub struct SwitchExecutor;

#[derive(Debug, Deserialize)]
struct SwitchCase {
    value: Value,
    #[serde(default)]
    label: Option<String>,
}

impl BlockExecutor for SwitchExecutor {
    fn kind(&self) -> &'static str {
        "switch"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let field = block.config_str("field");
            if field.is_empty() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: "field is required".into(),
                });
            }
            let cases: Vec<SwitchCase> = block
                .config
                .get("cases")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();

            let scope = scope_of(inputs);
            let actual = template::resolve_path(&scope, template::strip_placeholder(field))
                .cloned()
                .unwrap_or(Value::Null);

            let branch = cases
                .iter()
                .find(|case| loose_eq(&actual, &case.value))
                .map(|case| {
                    case.label
                        .clone()
                        .unwrap_or_else(|| template::display_value(&case.value))
                })
                .unwrap_or_else(|| "default".to_string());

            let mut out = JsonMap::new();
            out.insert("branch".into(), Value::String(branch.clone()));
            out.insert("response".into(), Value::String(branch));
            out.insert("value".into(), actual);
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::{StaticCatalog, StaticToolRegistry};
    use crate::model::BlockType;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> RunContext {
        RunContext::builder(
            Arc::new(StaticToolRegistry::new()),
            Arc::new(StaticCatalog::new()),
        )
        .build()
    }

    fn cond(field: &str, op: &str, value: Value) -> Condition {
        Condition {
            field: field.into(),
            operator: op.into(),
            value,
        }
    }

    #[test]
    fn test_eq_with_numeric_coercion() {
        let scope = json!({"n": 5, "s": "5"});
        assert!(eval_condition(&cond("n", "eq", json!("5")), &scope));
        assert!(eval_condition(&cond("s", "eq", json!(5)), &scope));
        assert!(!eval_condition(&cond("n", "eq", json!(6)), &scope));
    }

    #[test]
    fn test_ordering_operators() {
        let scope = json!({"score": 7});
        assert!(eval_condition(&cond("score", "gt", json!(5)), &scope));
        assert!(eval_condition(&cond("score", "gte", json!(7)), &scope));
        assert!(eval_condition(&cond("score", "lte", json!(7)), &scope));
        assert!(!eval_condition(&cond("score", "lt", json!(7)), &scope));
    }

    #[test]
    fn test_contains_string_and_array() {
        let scope = json!({"tags": ["a", "b"], "text": "hello world"});
        assert!(eval_condition(&cond("tags", "contains", json!("a")), &scope));
        assert!(!eval_condition(&cond("tags", "contains", json!("c")), &scope));
        assert!(eval_condition(&cond("text", "contains", json!("world")), &scope));
        assert!(eval_condition(&cond("tags", "not_contains", json!("z")), &scope));
    }

    #[test]
    fn test_empty_and_truthy() {
        let scope = json!({"empty": "", "list": [], "flag": true, "off": "false"});
        assert!(eval_condition(&cond("empty", "is_empty", Value::Null), &scope));
        assert!(eval_condition(&cond("list", "is_empty", Value::Null), &scope));
        assert!(eval_condition(&cond("missing", "is_empty", Value::Null), &scope));
        assert!(eval_condition(&cond("flag", "is_true", Value::Null), &scope));
        assert!(eval_condition(&cond("off", "is_false", Value::Null), &scope));
        assert!(eval_condition(&cond("flag", "not_empty", Value::Null), &scope));
    }

    #[test]
    fn test_starts_ends_with() {
        let scope = json!({"name": "workflow-engine"});
        assert!(eval_condition(&cond("name", "starts_with", json!("work")), &scope));
        assert!(eval_condition(&cond("name", "ends_with", json!("engine")), &scope));
        assert!(!eval_condition(&cond("name", "starts_with", json!("engine")), &scope));
    }

    #[test]
    fn test_unknown_operator_is_false() {
        let scope = json!({"x": 1});
        assert!(!eval_condition(&cond("x", "approximately", json!(1)), &scope));
    }

    #[tokio::test]
    async fn test_if_condition_emits_branch() {
        let block = Block::new("check", BlockType::IfCondition)
            .with_config("field", json!("count"))
            .with_config("operator", json!("gt"))
            .with_config("value", json!(10));

        let inputs = json!({"count": 42}).as_object().unwrap().clone();
        let out = IfConditionExecutor
            .execute(&ctx(), &block, &inputs)
            .await
            .unwrap();
        assert_eq!(out["branch"], json!("true"));
        assert_eq!(out["response"], json!(true));

        let inputs = json!({"count": 3}).as_object().unwrap().clone();
        let out = IfConditionExecutor
            .execute(&ctx(), &block, &inputs)
            .await
            .unwrap();
        assert_eq!(out["branch"], json!("false"));
    }

    #[tokio::test]
    async fn test_switch_first_match_wins() {
        let block = Block::new("route", BlockType::Switch)
            .with_config("field", json!("kind"))
            .with_config(
                "cases",
                json!([
                    {"value": "bug", "label": "triage"},
                    {"value": "bug", "label": "never-reached"},
                    {"value": "feature"}
                ]),
            );

        let inputs = json!({"kind": "bug"}).as_object().unwrap().clone();
        let out = SwitchExecutor.execute(&ctx(), &block, &inputs).await.unwrap();
        assert_eq!(out["branch"], json!("triage"));

        let inputs = json!({"kind": "feature"}).as_object().unwrap().clone();
        let out = SwitchExecutor.execute(&ctx(), &block, &inputs).await.unwrap();
        assert_eq!(out["branch"], json!("feature"));
    }

    #[tokio::test]
    async fn test_switch_falls_through_to_default() {
        let block = Block::new("route", BlockType::Switch)
            .with_config("field", json!("kind"))
            .with_config("cases", json!([{"value": "bug"}]));
        let inputs = json!({"kind": "question"}).as_object().unwrap().clone();
        let out = SwitchExecutor.execute(&ctx(), &block, &inputs).await.unwrap();
        assert_eq!(out["branch"], json!("default"));
    }
}
