//! Upstream payload classification
//!
//! Decodes one raw upstream unit into at most one [`StreamUnit`]. Recognized
//! shapes:
//!
//! | Raw shape | Result |
//! |---|---|
//! | bare string | `TextDelta` |
//! | `{"type":"message","data":"..."}` | `TextDelta` |
//! | `{"type":"message","data":{"type":"text","text":"..."}}` | `TextDelta` |
//! | `{"type":"message","data":{"type":"component",...}}` | `Component` |
//! | `{"type":"event","event":"on_message_delta",...}` | `TextDelta` |
//! | `{"type":"event","event":"message","data":...}` | same as `message` |
//! | `{"type":"error",...}` / `on_error` | `Error` |
//! | `heartbeat` / `ping` / `on_ping` | `Heartbeat` |
//! | `done` / `on_message_end` / `on_chat_end` | `Complete` |
//!
//! Anything else is dropped with a log record. Classification never panics
//! and never aborts the relay.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::types::{ComponentPayload, ComponentStatus, RawUnit, RelayFailure, StreamUnit};

type Object = Map<String, Value>;

/// Classify one raw unit
pub fn classify(raw: &RawUnit) -> Option<StreamUnit> {
    match raw {
        Value::String(text) => text_delta(text),
        Value::Object(obj) => classify_object(obj),
        Value::Null => {
            debug!("Classifier: dropping null unit");
            None
        }
        other => {
            debug!(kind = value_kind(other), "Classifier: dropping non-object unit");
            None
        }
    }
}

fn classify_object(obj: &Object) -> Option<StreamUnit> {
    match obj.get("type").and_then(Value::as_str) {
        Some("message") => classify_message(obj),
        Some("text") => text_field(obj).and_then(text_delta),
        Some("component") => classify_component(obj),
        Some("event") => classify_event(obj),
        Some("error") => Some(upstream_error(obj)),
        Some("heartbeat") | Some("ping") => Some(StreamUnit::Heartbeat),
        Some("done") | Some("end") => Some(StreamUnit::Complete(obj.get("data").cloned())),
        Some(other) => {
            debug!(unit_type = other, "Classifier: dropping unit with unknown type");
            None
        }
        None if obj.contains_key("event") => classify_event(obj),
        None => {
            debug!(
                keys = ?obj.keys().collect::<Vec<_>>(),
                "Classifier: dropping untyped object"
            );
            None
        }
    }
}

/// `message` branch: payload is a string or a nested typed object
fn classify_message(obj: &Object) -> Option<StreamUnit> {
    let payload = obj
        .get("data")
        .or_else(|| obj.get("content"))
        .or_else(|| obj.get("message"));

    match payload {
        Some(Value::String(text)) => text_delta(text),
        Some(Value::Object(inner)) => classify_nested(inner),
        Some(other) => {
            warn!(kind = value_kind(other), "Classifier: message payload has unusable shape");
            None
        }
        None => {
            warn!("Classifier: message unit without payload");
            None
        }
    }
}

fn classify_nested(inner: &Object) -> Option<StreamUnit> {
    match inner.get("type").and_then(Value::as_str) {
        Some("text") => text_field(inner).and_then(text_delta),
        Some("component") => classify_component(inner),
        other => {
            debug!(nested_type = ?other, "Classifier: dropping nested message payload");
            None
        }
    }
}

fn classify_event(obj: &Object) -> Option<StreamUnit> {
    match obj.get("event").and_then(Value::as_str) {
        Some("on_message_delta") => match delta_content(obj) {
            Some(text) => text_delta(text),
            None => {
                warn!("Classifier: on_message_delta without content");
                None
            }
        },
        Some("message") => classify_message(obj),
        Some("on_message_end") | Some("on_chat_end") | Some("done") => {
            Some(StreamUnit::Complete(obj.get("data").cloned()))
        }
        Some("on_error") | Some("error") => Some(upstream_error(obj)),
        Some("on_ping") | Some("ping") => Some(StreamUnit::Heartbeat),
        Some(other) => {
            debug!(event = other, "Classifier: dropping unhandled event");
            None
        }
        None => {
            warn!("Classifier: event unit without event name");
            None
        }
    }
}

/// Delta text for `on_message_delta`: `content`, `delta`, `data.content`,
/// `data.delta`, or a string `data`
fn delta_content(obj: &Object) -> Option<&str> {
    if let Some(text) = obj.get("content").and_then(Value::as_str) {
        return Some(text);
    }
    if let Some(text) = obj.get("delta").and_then(Value::as_str) {
        return Some(text);
    }
    match obj.get("data") {
        Some(Value::String(text)) => Some(text),
        Some(Value::Object(data)) => data
            .get("content")
            .or_else(|| data.get("delta"))
            .and_then(Value::as_str),
        _ => None,
    }
}

fn classify_component(obj: &Object) -> Option<StreamUnit> {
    let body = match obj.get("component") {
        Some(Value::Object(inner)) => inner,
        _ => obj,
    };

    let data = match body.get("data") {
        Some(Value::Array(items)) => items.clone(),
        Some(item @ Value::Object(_)) => vec![item.clone()],
        _ => Vec::new(),
    };

    let id = match body.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            // Identity falls back to the content itself so repeats still dedupe
            let fallback = format!("anonymous:{}", Value::Array(data.clone()));
            debug!("Classifier: component without id, using content identity");
            fallback
        }
    };

    let status = match body.get("status").and_then(Value::as_str) {
        Some(raw) => ComponentStatus::parse(raw).unwrap_or_else(|| {
            debug!(status = raw, component_id = %id, "Classifier: unknown component status, treating as pending");
            ComponentStatus::Pending
        }),
        None => ComponentStatus::Pending,
    };

    Some(StreamUnit::Component(ComponentPayload::new(id, status, data)))
}

fn upstream_error(obj: &Object) -> StreamUnit {
    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| match obj.get("error") {
            Some(Value::String(text)) => Some(text.as_str()),
            Some(Value::Object(err)) => err.get("message").and_then(Value::as_str),
            _ => None,
        })
        .or_else(|| obj.get("data").and_then(Value::as_str))
        .unwrap_or("unknown upstream error");

    StreamUnit::Error(RelayFailure::Upstream(message.to_string()))
}

fn text_field(obj: &Object) -> Option<&str> {
    obj.get("text")
        .or_else(|| obj.get("content"))
        .and_then(Value::as_str)
}

fn text_delta(text: &str) -> Option<StreamUnit> {
    if text.is_empty() {
        debug!("Classifier: dropping empty text delta");
        return None;
    }
    Some(StreamUnit::TextDelta(text.to_string()))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str) -> Option<StreamUnit> {
        Some(StreamUnit::TextDelta(s.to_string()))
    }

    #[test]
    fn test_bare_string_is_text_delta() {
        assert_eq!(classify(&json!("Hello")), text("Hello"));
    }

    #[test]
    fn test_message_with_string_payload() {
        assert_eq!(classify(&json!({"type": "message", "data": "Hello"})), text("Hello"));
    }

    #[test]
    fn test_message_with_nested_text() {
        let raw = json!({"type": "message", "data": {"type": "text", "text": " world"}});
        assert_eq!(classify(&raw), text(" world"));
    }

    #[test]
    fn test_message_with_nested_component() {
        let raw = json!({
            "type": "message",
            "data": {
                "type": "component",
                "id": "c1",
                "status": "success",
                "data": [{"document": {"name": "Law A", "fileUrl": "http://x/a"}}]
            }
        });
        match classify(&raw) {
            Some(StreamUnit::Component(payload)) => {
                assert_eq!(payload.id, "c1");
                assert_eq!(payload.status, ComponentStatus::Success);
                assert_eq!(payload.data.len(), 1);
                assert!(payload.items.is_empty(), "extraction happens later");
            }
            other => panic!("expected component, got {:?}", other),
        }
    }

    #[test]
    fn test_on_message_delta_variants() {
        let direct = json!({"type": "event", "event": "on_message_delta", "content": "a"});
        let nested = json!({"type": "event", "event": "on_message_delta", "data": {"content": "b"}});
        let delta = json!({"type": "event", "event": "on_message_delta", "data": {"delta": "c"}});
        assert_eq!(classify(&direct), text("a"));
        assert_eq!(classify(&nested), text("b"));
        assert_eq!(classify(&delta), text("c"));
    }

    #[test]
    fn test_event_message_mirrors_message_branch() {
        let raw = json!({"type": "event", "event": "message", "data": {"type": "text", "text": "x"}});
        assert_eq!(classify(&raw), text("x"));
        let untyped = json!({"event": "message", "data": "y"});
        assert_eq!(classify(&untyped), text("y"));
    }

    #[test]
    fn test_terminal_and_control_units() {
        assert_eq!(
            classify(&json!({"type": "event", "event": "on_chat_end"})),
            Some(StreamUnit::Complete(None))
        );
        assert_eq!(classify(&json!({"type": "ping"})), Some(StreamUnit::Heartbeat));
        assert_eq!(
            classify(&json!({"type": "error", "error": {"message": "quota exceeded"}})),
            Some(StreamUnit::Error(RelayFailure::Upstream("quota exceeded".to_string())))
        );
    }

    #[test]
    fn test_component_status_defaults_to_pending() {
        let raw = json!({"type": "component", "id": 7});
        match classify(&raw) {
            Some(StreamUnit::Component(payload)) => {
                assert_eq!(payload.id, "7");
                assert_eq!(payload.status, ComponentStatus::Pending);
            }
            other => panic!("expected component, got {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_shapes_are_dropped() {
        let samples = vec![
            json!(null),
            json!(42),
            json!(true),
            json!([1, 2, 3]),
            json!({}),
            json!({"type": "mystery"}),
            json!({"type": "message"}),
            json!({"type": "message", "data": 12}),
            json!({"type": "message", "data": {"type": "image"}}),
            json!({"type": "event"}),
            json!({"type": "event", "event": "on_tool_start"}),
            json!({"type": "event", "event": "on_message_delta"}),
            json!(""),
        ];
        for raw in samples {
            assert_eq!(classify(&raw), None, "should drop {}", raw);
        }
    }
}
