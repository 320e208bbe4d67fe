use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionStatus, NodeExecutionState, SkipReason};

/// One entry of an execution's append-only event log.
///
/// `id` is the per-execution sequence number (starting at 1, no gaps) and is
/// the only cursor a stream consumer needs to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ExecutionEvent {
    pub fn event_type(&self) -> &'static str {
        self.kind.type_tag()
    }

    pub fn is_stream_end(&self) -> bool {
        matches!(self.kind, EventKind::StreamEnd { .. })
    }
}

/// Closed set of event types with their payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventKind {
    ExecutionStarted {
        workflow_id: String,
        entry_node_ids: Vec<String>,
    },
    ExecutionPaused,
    ExecutionResumed,
    ExecutionCompleted {
        duration_ms: u64,
    },
    ExecutionFailed {
        error: String,
        failed_node_ids: Vec<String>,
    },
    ExecutionAborted {
        reason: Option<String>,
    },
    NodeStarted {
        node_type: String,
        attempt: u32,
        lane_id: String,
    },
    NodeCompleted {
        output: serde_json::Value,
        duration_ms: u64,
    },
    NodeFailed {
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    NodeSkipped {
        reason: SkipReason,
    },
    GateWaiting {
        gate_id: String,
        options: Vec<String>,
        required: bool,
        timeout_seconds: Option<u64>,
    },
    GateDecided {
        gate_id: String,
        selected_option: String,
        decided_by: String,
        reason: Option<String>,
        auto_resolved: bool,
    },
    CliOutput {
        text: String,
    },
    CliError {
        text: String,
    },
    CliExit {
        exit_code: i32,
    },
    VariableUpdated {
        name: String,
        value: serde_json::Value,
        previous: Option<serde_json::Value>,
        source_node_id: Option<String>,
    },
    StreamEnd {
        final_status: ExecutionStatus,
    },
}

impl EventKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionPaused => "execution_paused",
            Self::ExecutionResumed => "execution_resumed",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionAborted { .. } => "execution_aborted",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeFailed { .. } => "node_failed",
            Self::NodeSkipped { .. } => "node_skipped",
            Self::GateWaiting { .. } => "gate_waiting",
            Self::GateDecided { .. } => "gate_decided",
            Self::CliOutput { .. } => "cli_output",
            Self::CliError { .. } => "cli_error",
            Self::CliExit { .. } => "cli_exit",
            Self::VariableUpdated { .. } => "variable_updated",
            Self::StreamEnd { .. } => "stream_end",
        }
    }
}

/// Snapshot sent as the first frame of every stream connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedSnapshot {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub node_states: std::collections::BTreeMap<String, NodeExecutionState>,
    pub variables: std::collections::BTreeMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    /// Highest sequence number committed at connect time.
    pub last_event_id: u64,
    /// Recommended client reconnect delay.
    pub retry_ms: u64,
}

/// A frame delivered on an execution event stream.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Connected(ConnectedSnapshot),
    Event(ExecutionEvent),
    /// Idle keep-alive; carries no sequence number.
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_and_payload() {
        let event = ExecutionEvent {
            id: 7,
            timestamp: Utc::now(),
            node_id: Some("build".into()),
            kind: EventKind::NodeFailed {
                error: "exit 1".into(),
                attempt: 1,
                will_retry: true,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["type"], "node_failed");
        assert_eq!(json["nodeId"], "build");
        assert_eq!(json["payload"]["willRetry"], true);
        assert_eq!(event.event_type(), "node_failed");
    }

    #[test]
    fn unit_variant_has_type_only() {
        let event = ExecutionEvent {
            id: 1,
            timestamp: Utc::now(),
            node_id: None,
            kind: EventKind::ExecutionPaused,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execution_paused");
        assert!(json.get("nodeId").is_none());
    }

    #[test]
    fn stream_end_detection() {
        let event = ExecutionEvent {
            id: 3,
            timestamp: Utc::now(),
            node_id: None,
            kind: EventKind::StreamEnd {
                final_status: ExecutionStatus::Completed,
            },
        };
        assert!(event.is_stream_end());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["finalStatus"], "completed");
    }
}
