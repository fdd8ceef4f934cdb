//! OpenAI Shim: request validation, stage→model rewrite, SSE framing, and
//! error envelopes. Ported function-for-function from `cfx/openai_compat.py`.

use serde_json::{json, Value};

/// Validate that a request body is a well-formed OpenAI-compatible chat
/// completion request: `messages` present, a non-empty list of objects each
/// carrying `role` and `content`.
pub fn validate_request(body: &Value) -> Result<(), String> {
    let messages = match body.get("messages") {
        Some(v) => v,
        None => return Err("Missing 'messages' field".to_string()),
    };

    let messages = match messages.as_array() {
        Some(a) => a,
        None => return Err("'messages' must be a list".to_string()),
    };

    if messages.is_empty() {
        return Err("'messages' cannot be empty".to_string());
    }

    for message in messages {
        let Some(obj) = message.as_object() else {
            return Err("Each message must be a dict".to_string());
        };
        if !obj.contains_key("role") || !obj.contains_key("content") {
            return Err("Each message must have 'role' and 'content' fields".to_string());
        }
    }

    Ok(())
}

/// Rewrite the request's `model` field to the resolved stage model, and
/// default `stream` to `false` when absent.
pub fn rewrite_model(body: &Value, model_override: &str) -> Value {
    let mut transformed = body.clone();
    if let Some(obj) = transformed.as_object_mut() {
        obj.insert("model".to_string(), Value::String(model_override.to_string()));
        obj.entry("stream").or_insert(Value::Bool(false));
    }
    transformed
}

pub fn format_sse_event(data: &Value) -> String {
    format!("data: {}\n\n", data)
}

pub fn format_sse_done() -> &'static str {
    "data: [DONE]\n\n"
}

/// Parse one line of an upstream SSE stream. Returns `None` for blank lines
/// and `:`-prefixed comments, `Some(Ok(None))` for the `[DONE]` sentinel, and
/// `Some(Ok(Some(value)))` for a successfully parsed JSON event. Malformed
/// JSON is silently skipped (returns `None`), matching the original's
/// `except json.JSONDecodeError: continue`.
pub fn parse_sse_line(line: &str) -> Option<Result<Option<Value>, ()>> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data_str = line.strip_prefix("data: ")?.trim();
    if data_str == "[DONE]" {
        return Some(Ok(None));
    }
    match serde_json::from_str(data_str) {
        Ok(value) => Some(Ok(Some(value))),
        Err(_) => None,
    }
}

pub fn error_envelope(error_type: &str, message: &str, code: Option<&str>) -> Value {
    let mut error = json!({ "message": message, "type": error_type });
    if let Some(code) = code {
        error["code"] = Value::String(code.to_string());
    }
    json!({ "error": error })
}
