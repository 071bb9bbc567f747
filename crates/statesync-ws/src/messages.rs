use serde_json::{json, Value};

/// Build an outbound envelope, tagging it with the user id when one is set.
pub fn envelope(kind: &str, user_id: Option<&str>, fields: Value) -> Value {
    let mut msg = match fields {
        Value::Object(map) => Value::Object(map),
        Value::Null => json!({}),
        other => json!({ "data": other }),
    };
    msg["type"] = json!(kind);
    if let Some(user_id) = user_id {
        msg["user_id"] = json!(user_id);
    }
    msg
}

/// Liveness probe sent on open and on every ping interval.
pub fn probe(user_id: Option<&str>) -> Value {
    envelope("ping", user_id, Value::Null)
}

/// Whether a raw frame is one of our own liveness messages echoed back.
pub fn is_liveness(frame: &str) -> bool {
    serde_json::from_str::<Value>(frame)
        .ok()
        .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
        .map_or(false, |t| t == "ping" || t == "pong")
}
