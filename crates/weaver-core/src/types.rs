use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::ExecutionEvent;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Overall execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    WaitingGate,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingGate => "waiting_gate",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "waiting_gate" => Ok(Self::WaitingGate),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Per-node status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    WaitingGate,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Counts toward "work still in flight" for completion detection.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingGate)
    }
}

/// Why a node was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ConditionNotMet,
    UpstreamFailed,
    ExecutionAborted,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ConditionNotMet => "condition_not_met",
            Self::UpstreamFailed => "upstream_failed",
            Self::ExecutionAborted => "execution_aborted",
        };
        f.write_str(s)
    }
}

/// Runtime state of one node within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionState {
    pub node_id: String,
    pub status: NodeStatus,
    /// 1-based count of runs of this node, across retries.
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub session_id: Option<String>,
}

impl NodeExecutionState {
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            attempt: 0,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
            skip_reason: None,
            session_id: None,
        }
    }
}

/// Runtime status of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Decided,
    Expired,
    Skipped,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Decided => "decided",
            Self::Expired => "expired",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// A recorded gate decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub selected_option: String,
    pub decided_by: String,
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
    /// True when the system applied the default option on timeout.
    pub auto_resolved: bool,
}

/// Runtime instance of a gate definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateInstance {
    pub gate_id: String,
    pub node_id: String,
    pub status: GateStatus,
    pub required: bool,
    pub options: Vec<String>,
    pub timeout_seconds: Option<u64>,
    pub opened_at: DateTime<Utc>,
    pub decision: Option<GateDecision>,
}

/// Full, immutable view of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub current_node_id: Option<String>,
    pub current_lane_ids: Vec<String>,
    pub node_states: BTreeMap<String, NodeExecutionState>,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub gates: Vec<GateInstance>,
    pub events: Vec<ExecutionEvent>,
    pub work_item: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Summary row for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub current_node_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Result of `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedExecution {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub current_node_id: Option<String>,
    pub entry_node_ids: Vec<String>,
}

/// Result of pause/resume/abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub timestamp: DateTime<Utc>,
}

/// Result of a gate decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecisionResult {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub next_node_id: Option<String>,
}

/// Paginated listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip_via_str() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::WaitingGate,
            ExecutionStatus::Aborted,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(!ExecutionStatus::WaitingGate.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::WaitingGate.is_terminal());
        assert!(NodeStatus::WaitingGate.is_active());
    }

    #[test]
    fn node_state_serializes_camel_case() {
        let state = NodeExecutionState::pending("n1");
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["nodeId"], "n1");
        assert_eq!(json["status"], "pending");
        assert!(json.get("skipReason").is_some());
    }
}
