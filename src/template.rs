//! `{{path}}` template resolution against a nested JSON scope.
//!
//! Paths are dot-separated with optional bracket indices: `a.b[0].c` and
//! `a.b.0.c` are equivalent. A string that is exactly one placeholder
//! resolves to the raw value (types preserved); mixed text interpolates
//! to a string. Missing paths keep the original `{{...}}` literal — a
//! placeholder is never silently replaced with an empty string.

use serde_json::{Map, Value};
use tracing::warn;

/// Resolve a dotted/bracketed path against a JSON value.
///
/// Key lookup is exact; numeric segments index into arrays. Returns
/// `None` when any segment misses.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in parse_path(path) {
        current = match segment {
            Segment::Key(key) => match current {
                Value::Object(map) => map.get(key)?,
                // Dotted numeric form: `items.0` on an array.
                Value::Array(items) => {
                    let idx: usize = key.parse().ok()?;
                    items.get(idx)?
                }
                _ => return None,
            },
            Segment::Index(idx) => match current {
                Value::Array(items) => items.get(idx)?,
                // Structured values arrive serialized as maps; allow a
                // stringified index key as a fallback.
                Value::Object(map) => map.get(&idx.to_string())?,
                _ => return None,
            },
        };
    }
    Some(current)
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Split `a.b[0].c` into key and index segments.
fn parse_path(path: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let mut rest = part;
        // Leading name before any bracket.
        if let Some(open) = rest.find('[') {
            let (name, brackets) = rest.split_at(open);
            if !name.is_empty() {
                segments.push(Segment::Key(name));
            }
            rest = brackets;
            while let Some(stripped) = rest.strip_prefix('[') {
                match stripped.find(']') {
                    Some(close) => {
                        if let Ok(idx) = stripped[..close].parse::<usize>() {
                            segments.push(Segment::Index(idx));
                        } else {
                            // Non-numeric bracket content: treat as a key.
                            segments.push(Segment::Key(&stripped[..close]));
                        }
                        rest = &stripped[close + 1..];
                    }
                    None => break,
                }
            }
        } else {
            segments.push(Segment::Key(rest));
        }
    }
    segments
}

/// Render a template string against a scope.
///
/// A string that is exactly `{{path}}` returns the resolved value with
/// its type preserved. Anything else interpolates each placeholder to
/// text. Unresolvable placeholders are kept verbatim and logged.
pub fn render_str(template: &str, scope: &Value) -> Value {
    if let Some(path) = single_placeholder(template) {
        return match resolve_path(scope, path) {
            Some(v) => v.clone(),
            None => {
                warn!(path, "template path not found, keeping literal");
                Value::String(template.to_string())
            }
        };
    }
    Value::String(interpolate(template, scope))
}

/// Render a template string, always producing text.
pub fn render_string(template: &str, scope: &Value) -> String {
    match render_str(template, scope) {
        Value::String(s) => s,
        other => display_value(&other),
    }
}

/// Recursively render templates inside a JSON value: strings are
/// rendered, maps and arrays descend, everything else passes through.
pub fn render_deep(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => render_str(s, scope),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_deep(v, scope));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_deep(v, scope)).collect()),
        other => other.clone(),
    }
}

/// If the whole string is one `{{...}}` placeholder, return its path.
pub fn single_placeholder(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Strip optional `{{ }}` wrapping from a config path (for fields that
/// accept either `items` or `{{items}}`).
pub fn strip_placeholder(s: &str) -> &str {
    single_placeholder(s).unwrap_or(s.trim())
}

/// Replace every `{{path}}` occurrence in `template` with display text.
fn interpolate(template: &str, scope: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                match resolve_path(scope, path) {
                    Some(v) => out.push_str(&display_value(v)),
                    None => {
                        warn!(path, "template path not found, keeping literal");
                        out.push_str(&rest[start..start + 2 + end + 2]);
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder: emit as-is.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Display form used during interpolation: numbers without trailing
/// zeros, booleans as `true`/`false`, complex values as compact JSON.
pub fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", f as i64)
                } else {
                    format!("{}", f)
                }
            } else {
                n.to_string()
            }
        }
        other => other.to_string(),
    }
}
