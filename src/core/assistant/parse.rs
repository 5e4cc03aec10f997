//! Assistant stdout parsing: JSON extraction fallbacks and result
//! normalization.
//!
//! The assistant CLI is supposed to print one JSON object, but in practice
//! the payload arrives wrapped in markdown fences, preceded by log noise, or
//! as an event array. [`extract_json`] tries four strategies in order;
//! [`extract_result`] then normalizes whatever parsed into a [`ParsedResult`],
//! accepting both `session_id` and `sessionid` style keys.

use std::collections::BTreeMap;

use serde_json::Value;

/// Per-model token counts reported by the assistant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTokens {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// Normalized view of one assistant response payload.
#[derive(Debug, Clone, Default)]
pub struct ParsedResult {
    pub text: String,
    pub is_error: bool,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub duration_api_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub stop_reason: Option<String>,
    pub model_usage: BTreeMap<String, ModelTokens>,
}

/// Fold a JSON key for casing-insensitive comparison: `session_id`,
/// `sessionId` and `sessionid` all fold to `sessionid`.
fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Look up `name` (canonical snake_case) in an object, accepting any casing
/// that folds to the same key.
pub(crate) fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let obj = value.as_object()?;
    let wanted = fold_key(name);
    obj.iter()
        .find(|(k, _)| fold_key(k) == wanted)
        .map(|(_, v)| v)
}

fn field_str(value: &Value, name: &str) -> Option<String> {
    field(value, name)?.as_str().map(|s| s.to_string())
}

fn field_u64(value: &Value, name: &str) -> Option<u64> {
    field(value, name)?.as_u64()
}

fn field_f64(value: &Value, name: &str) -> Option<f64> {
    field(value, name)?.as_f64()
}

fn field_bool(value: &Value, name: &str) -> Option<bool> {
    field(value, name)?.as_bool()
}

/// Extract a JSON value from raw assistant stdout.
///
/// Strategies, in order:
/// 1. parse the whole trimmed text;
/// 2. strip a single markdown fence and parse the body;
/// 3. brace-match the outermost object that carries a `"type"` key;
/// 4. take the largest terminal object, scanning backward from the last `}`.
pub fn extract_json(stdout: &str) -> Option<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    if let Some(body) = strip_fence(trimmed)
        && let Ok(v) = serde_json::from_str::<Value>(body)
    {
        return Some(v);
    }

    if let Some(v) = typed_object(trimmed) {
        return Some(v);
    }

    terminal_object(trimmed)
}

/// Strip one ```fence``` (with optional language tag) and return the body.
fn strip_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    let end = rest.rfind("```")?;
    Some(rest[..end].trim())
}

/// Find the index of the `}` matching the `{` at `open`, honoring strings
/// and escapes. Returns `None` when unbalanced.
fn matching_close(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Strategy 3: the outermost brace-matched object containing a `type` key.
fn typed_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    for (start, &b) in bytes.iter().enumerate() {
        if b != b'{' {
            continue;
        }
        let Some(end) = matching_close(text, start) else {
            continue;
        };
        if let Ok(v) = serde_json::from_str::<Value>(&text[start..=end])
            && field(&v, "type").is_some()
        {
            return Some(v);
        }
    }
    None
}

/// Strategy 4: the largest object ending at the last `}`, found by scanning
/// brace depth backward.
fn terminal_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let last = bytes.iter().rposition(|&b| b == b'}')?;
    let mut depth = 0i64;
    for i in (0..=last).rev() {
        match bytes[i] {
            b'}' => depth += 1,
            b'{' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str::<Value>(&text[i..=last]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

const MAX_TURNS_MESSAGE: &str =
    "The assistant hit its maximum number of turns before finishing. \
     Try breaking the request into smaller pieces.";
const UNPARSEABLE_MESSAGE: &str = "Could not parse the assistant response.";

/// Normalize a parsed payload into a [`ParsedResult`].
///
/// Arrays are resolved to their `type == "result"` element when one exists;
/// otherwise the elements' `text` fields are joined. Error subtypes map to
/// friendly messages with `is_error` set.
pub fn extract_result(value: &Value) -> ParsedResult {
    if let Some(items) = value.as_array() {
        if let Some(result_el) = items
            .iter()
            .find(|el| field_str(el, "type").as_deref() == Some("result"))
        {
            return extract_result(result_el);
        }
        let text = items
            .iter()
            .filter_map(|el| field_str(el, "text"))
            .collect::<Vec<_>>()
            .join("\n");
        return ParsedResult {
            text,
            ..Default::default()
        };
    }

    let mut parsed = ParsedResult {
        is_error: field_bool(value, "is_error").unwrap_or(false),
        session_id: field_str(value, "session_id"),
        cost_usd: field_f64(value, "total_cost_usd").or_else(|| field_f64(value, "cost_usd")),
        duration_ms: field_u64(value, "duration_ms"),
        duration_api_ms: field_u64(value, "duration_api_ms"),
        num_turns: field_u64(value, "num_turns").map(|n| n as u32),
        stop_reason: field_str(value, "stop_reason"),
        model_usage: extract_model_usage(value),
        ..Default::default()
    };

    if let Some(subtype) = field_str(value, "subtype") {
        if subtype == "error_max_turns" {
            parsed.text = MAX_TURNS_MESSAGE.to_string();
            parsed.is_error = true;
            return parsed;
        }
        if subtype.starts_with("error") {
            let detail = body_text(value).unwrap_or(subtype);
            parsed.text = format!("The assistant reported an error: {}", detail);
            parsed.is_error = true;
            return parsed;
        }
    }

    match body_text(value) {
        Some(text) => parsed.text = text,
        None => parsed.text = UNPARSEABLE_MESSAGE.to_string(),
    }
    parsed
}

/// Pull the response body from `result` or `content` (string or text-block
/// array). `None` when the payload carries neither.
fn body_text(value: &Value) -> Option<String> {
    if let Some(result) = field(value, "result") {
        if let Some(s) = result.as_str() {
            return Some(s.to_string());
        }
        if result.is_object() || result.is_array() {
            return Some(result.to_string());
        }
    }
    let content = field(value, "content")?;
    if let Some(s) = content.as_str() {
        return Some(s.to_string());
    }
    if let Some(blocks) = content.as_array() {
        return Some(
            blocks
                .iter()
                .filter_map(|b| field_str(b, "text"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }
    None
}

fn extract_model_usage(value: &Value) -> BTreeMap<String, ModelTokens> {
    let mut usage = BTreeMap::new();
    let Some(map) = field(value, "model_usage").and_then(|v| v.as_object()) else {
        return usage;
    };
    for (model, counts) in map {
        usage.insert(
            model.clone(),
            ModelTokens {
                input_tokens: field_u64(counts, "input_tokens").unwrap_or(0),
                output_tokens: field_u64(counts, "output_tokens").unwrap_or(0),
                cache_read_input_tokens: field_u64(counts, "cache_read_input_tokens")
                    .unwrap_or(0),
                cache_creation_input_tokens: field_u64(counts, "cache_creation_input_tokens")
                    .unwrap_or(0),
            },
        );
    }
    usage
}
