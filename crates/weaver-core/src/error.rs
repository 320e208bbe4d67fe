use thiserror::Error;

use crate::types::{ExecutionStatus, GateStatus};

#[derive(Debug, Error)]
pub enum WeaverError {
    // Validation errors
    #[error("Workflow validation failed: {}", .0.join("; "))]
    InvalidWorkflow(Vec<String>),

    #[error("Required variable not provided: {0}")]
    MissingVariable(String),

    #[error("Variable '{name}' expects {expected}, got {actual}")]
    VariableType {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Expression error: {0}")]
    Expression(String),

    // State-conflict errors
    #[error("Cannot {operation} execution in status '{status}'")]
    InvalidState {
        operation: &'static str,
        status: ExecutionStatus,
    },

    #[error("Gate {gate_id} is not pending (status '{status}')")]
    GateNotPending { gate_id: String, status: GateStatus },

    #[error("Option '{option}' is not declared by gate {gate_id}")]
    InvalidGateOption { gate_id: String, option: String },

    // Not-found errors
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Gate not found: {0}")]
    GateNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Stream errors
    #[error("Event stream for execution {0} has ended")]
    StreamClosed(String),

    // Node-level errors
    #[error("Agent runner failed: {0}")]
    Runner(String),

    #[error("Node {node_id} timed out after {timeout_secs}s")]
    NodeTimeout { node_id: String, timeout_secs: u64 },

    #[error("Cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used by transports to pick a response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    StateConflict,
    NotFound,
    StreamClosed,
    Node,
    Service,
}

impl WeaverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidWorkflow(_)
            | Self::MissingVariable(_)
            | Self::VariableType { .. }
            | Self::Expression(_)
            | Self::InvalidGateOption { .. } => ErrorKind::Validation,
            Self::InvalidState { .. } | Self::GateNotPending { .. } => ErrorKind::StateConflict,
            Self::ExecutionNotFound(_) | Self::GateNotFound(_) | Self::NodeNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::StreamClosed(_) => ErrorKind::StreamClosed,
            Self::Runner(_) | Self::NodeTimeout { .. } | Self::Cancelled => ErrorKind::Node,
            Self::Config(_) | Self::ConfigNotFound(_) | Self::Io(_) | Self::Json(_) => {
                ErrorKind::Service
            }
        }
    }

    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidWorkflow(_) => "invalid_workflow",
            Self::MissingVariable(_) => "missing_variable",
            Self::VariableType { .. } => "variable_type",
            Self::Expression(_) => "expression",
            Self::InvalidState { .. } => "invalid_state",
            Self::GateNotPending { .. } => "gate_not_pending",
            Self::InvalidGateOption { .. } => "invalid_gate_option",
            Self::ExecutionNotFound(_) => "execution_not_found",
            Self::GateNotFound(_) => "gate_not_found",
            Self::NodeNotFound(_) => "node_not_found",
            Self::StreamClosed(_) => "stream_closed",
            Self::Runner(_) => "runner",
            Self::NodeTimeout { .. } => "node_timeout",
            Self::Cancelled => "cancelled",
            Self::Config(_) | Self::ConfigNotFound(_) => "config",
            Self::Io(_) | Self::Json(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, WeaverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_workflow_joins_issues() {
        let err = WeaverError::InvalidWorkflow(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Workflow validation failed: a; b");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn state_conflict_mentions_status() {
        let err = WeaverError::InvalidState {
            operation: "resume",
            status: ExecutionStatus::Running,
        };
        assert_eq!(err.to_string(), "Cannot resume execution in status 'running'");
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert_eq!(err.code(), "invalid_state");
    }

    #[test]
    fn not_found_kinds() {
        assert_eq!(
            WeaverError::ExecutionNotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(WeaverError::GateNotFound("g".into()).kind(), ErrorKind::NotFound);
    }
}
