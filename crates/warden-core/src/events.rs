//! NDJSON admission event schemas and the child process stdout protocol.
//!
//! Child events are represented as a sealed union of known shapes plus an
//! "other" catch-all carrying the raw line, so unrecognized future event
//! types are forwarded rather than dropped or treated as fatal.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{BreakerReason, DenialCode, RunKind};

/// Admission-side events appended to the bounded NDJSON log (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionEvent {
    RunAllowed {
        ts: u64,
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "leaseId")]
        lease_id: String,
        #[serde(rename = "kindOfRun")]
        kind_of_run: RunKind,
        depth: u32,
        #[serde(rename = "idempotencyKey", skip_serializing_if = "Option::is_none")]
        idempotency_key: Option<String>,
    },
    RunDenied {
        ts: u64,
        code: DenialCode,
        #[serde(rename = "runId")]
        run_id: String,
        depth: u32,
    },
    SlotAllowed {
        ts: u64,
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "slotId")]
        slot_id: String,
    },
    SlotDenied {
        ts: u64,
        #[serde(rename = "runId")]
        run_id: String,
        code: DenialCode,
    },
    BreakerOpened {
        ts: u64,
        reason: BreakerReason,
        #[serde(rename = "cooldownMs")]
        cooldown_ms: u64,
    },
    StateError {
        ts: u64,
        detail: String,
    },
}

/// Classification of a single child-stdout progress marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    ToolStart,
    ToolEnd,
    Assistant,
    AssistantError,
    Other,
}

/// A single unit of progress derived from one child stdout line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub kind: MarkerKind,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl ProgressMarker {
    fn other(action: impl Into<String>) -> Self {
        Self {
            kind: MarkerKind::Other,
            action: action.into(),
            tool_name: None,
            fingerprint: None,
        }
    }
}

/// Raw child stdout envelope, tagged on `type` per §6. Unknown `type`
/// values still deserialize, carried through as [`MarkerKind::Other`].
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ChildEvent {
    #[serde(rename = "tool_execution_start")]
    ToolExecutionStart {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(rename = "tool_execution_end")]
    ToolExecutionEnd {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
    #[serde(rename = "message_end")]
    MessageEnd {
        #[serde(default)]
        message: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Parse one line of child stdout into a [`ProgressMarker`]. Malformed JSON
/// or an unrecognized shape never fails the run; it becomes an `other`
/// marker so the Supervisor keeps streaming.
#[must_use]
pub fn parse_child_line(line: &str) -> ProgressMarker {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ProgressMarker::other("empty_line");
    }

    let Ok(event) = serde_json::from_str::<ChildEvent>(trimmed) else {
        return ProgressMarker::other("malformed_json");
    };

    match event {
        ChildEvent::ToolExecutionStart { tool_name, args } => ProgressMarker {
            kind: MarkerKind::ToolStart,
            action: "tool_execution_start".to_string(),
            tool_name: Some(tool_name),
            fingerprint: Some(fingerprint_for(&args)),
        },
        ChildEvent::ToolExecutionEnd { tool_name, is_error } => ProgressMarker {
            kind: if is_error {
                MarkerKind::AssistantError
            } else {
                MarkerKind::ToolEnd
            },
            action: "tool_execution_end".to_string(),
            tool_name: Some(tool_name),
            fingerprint: None,
        },
        ChildEvent::MessageEnd { message } => ProgressMarker {
            kind: MarkerKind::Assistant,
            action: "message_end".to_string(),
            tool_name: None,
            fingerprint: Some(fingerprint_for(&message)),
        },
        ChildEvent::Unknown => ProgressMarker::other("unknown_type"),
    }
}

/// Stable fingerprint of a JSON value: keys sorted, then hashed. Used by the
/// Health Monitor (progress fingerprint) and the Governor (tool signature).
#[must_use]
pub fn fingerprint_for(value: &Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::hash::Hash::hash(&canonical, &mut hasher);
    format!("{:08x}", std::hash::Hasher::finish(&hasher) as u32)
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{k}:{}", canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_execution_start() {
        let line = r#"{"type":"tool_execution_start","toolName":"read","args":{"path":"a"}}"#;
        let marker = parse_child_line(line);
        assert_eq!(marker.kind, MarkerKind::ToolStart);
        assert_eq!(marker.tool_name.as_deref(), Some("read"));
        assert!(marker.fingerprint.is_some());
    }

    #[test]
    fn parses_tool_execution_end_error() {
        let line = r#"{"type":"tool_execution_end","toolName":"bash","isError":true}"#;
        let marker = parse_child_line(line);
        assert_eq!(marker.kind, MarkerKind::AssistantError);
    }

    #[test]
    fn malformed_json_becomes_other_marker() {
        let marker = parse_child_line("not json{{{");
        assert_eq!(marker.kind, MarkerKind::Other);
        assert_eq!(marker.action, "malformed_json");
    }

    #[test]
    fn unknown_type_is_tolerated_as_other() {
        let marker = parse_child_line(r#"{"type":"future_event","payload":1}"#);
        assert_eq!(marker.kind, MarkerKind::Other);
        assert_eq!(marker.action, "unknown_type");
    }

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        let a: Value = serde_json::json!({"a": 1, "b": 2});
        let b: Value = serde_json::json!({"b": 2, "a": 1});
        assert_eq!(fingerprint_for(&a), fingerprint_for(&b));
    }

    #[test]
    fn admission_event_serializes_with_tagged_kind() {
        let event = AdmissionEvent::RunDenied {
            ts: 1,
            code: DenialCode::CircuitOpenHostPressure,
            run_id: "r1".to_string(),
            depth: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"run_denied\""));
        assert!(json.contains("CIRCUIT_OPEN_HOST_PRESSURE"));
    }
}
