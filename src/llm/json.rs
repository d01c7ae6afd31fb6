//! Lenient JSON recovery for LLM output.
//!
//! Models wrap JSON in prose, code fences, or sloppy syntax. Recovery
//! order: direct parse, fenced code block, first balanced object or
//! array, then a light repair pass (trailing commas, single quotes).

use serde_json::Value;

/// Extract a JSON value from messy model output.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    if let Some(fenced) = fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(fenced.trim()) {
            return Some(v);
        }
        if let Ok(v) = serde_json::from_str::<Value>(&repair(fenced.trim())) {
            return Some(v);
        }
    }

    if let Some(balanced) = balanced_span(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(balanced) {
            return Some(v);
        }
        if let Ok(v) = serde_json::from_str::<Value>(&repair(balanced)) {
            return Some(v);
        }
    }

    serde_json::from_str::<Value>(&repair(trimmed)).ok()
}

/// Contents of the first ``` fence, with an optional language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the language tag line if present.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// The first balanced `{…}` or `[…]` span, respecting strings.
fn balanced_span(text: &str) -> Option<&str> {
    let open_idx = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let open = bytes[open_idx] as char;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[open_idx..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open_idx..open_idx + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Light repair: trailing commas removed, single quotes swapped to
/// double quotes outside double-quoted strings.
fn repair(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_double = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();

    for (i, &ch) in chars.iter().enumerate() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                out.push(ch);
                escaped = true;
            }
            '"' => {
                out.push(ch);
                in_double = !in_double;
            }
            '\'' if !in_double => out.push('"'),
            ',' if !in_double => {
                // Drop the comma when the next meaningful char closes a
                // container.
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    continue;
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_parse() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(json!({"a": 1})));
        assert_eq!(extract_json("[1, 2]"), Some(json!([1, 2])));
    }

    #[test]
    fn test_fenced_block() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json(text), Some(json!({"a": 1})));
    }

    #[test]
    fn test_fence_without_language_tag() {
        let text = "```\n{\"b\": 2}\n```";
        assert_eq!(extract_json(text), Some(json!({"b": 2})));
    }

    #[test]
    fn test_balanced_span_in_prose() {
        let text = r#"The result is {"score": 0.9, "ok": true} as requested."#;
        assert_eq!(extract_json(text), Some(json!({"score": 0.9, "ok": true})));
    }

    #[test]
    fn test_nested_braces_in_strings() {
        let text = r#"prefix {"msg": "has } brace", "n": 1} suffix"#;
        assert_eq!(
            extract_json(text),
            Some(json!({"msg": "has } brace", "n": 1}))
        );
    }

    #[test]
    fn test_repair_trailing_comma() {
        assert_eq!(extract_json(r#"{"a": 1,}"#), Some(json!({"a": 1})));
        assert_eq!(extract_json("[1, 2,]"), Some(json!([1, 2])));
    }

    #[test]
    fn test_repair_single_quotes() {
        assert_eq!(
            extract_json("{'key': 'value'}"),
            Some(json!({"key": "value"}))
        );
    }

    #[test]
    fn test_unrecoverable_is_none() {
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json(""), None);
    }
}
