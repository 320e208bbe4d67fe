use std::collections::BTreeMap;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::definition::AgentNode;
use crate::error::Result;
use crate::types::ExecutionId;

/// Everything a runner needs to execute one node attempt.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub execution_id: ExecutionId,
    pub node: AgentNode,
    /// Node config with `{{ variable }}` placeholders resolved.
    pub resolved_config: serde_json::Value,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub work_item: Option<serde_json::Value>,
    pub attempt: u32,
}

/// One item of a runner's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerChunk {
    Stdout(String),
    Stderr(String),
    /// Terminal item; nothing is read after it.
    Exit {
        exit_code: i32,
        output: Option<serde_json::Value>,
        error: Option<String>,
    },
}

impl RunnerChunk {
    pub fn success(output: serde_json::Value) -> Self {
        Self::Exit {
            exit_code: 0,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(exit_code: i32, error: impl Into<String>) -> Self {
        Self::Exit {
            exit_code,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// External agent capability. Spawn mechanics live behind this trait.
///
/// Implementations must honor `cancel` promptly; the engine force-fails
/// nodes whose runner ignores it past the abort grace period.
pub trait AgentRunner: Send + Sync + 'static {
    /// Optional session id reported for the node (e.g. an external process or conversation id).
    fn session_id(&self, _request: &AgentRequest) -> Option<String> {
        None
    }

    /// Start a run and return its output stream, which ends with `RunnerChunk::Exit`.
    fn run(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<BoxStream<'static, RunnerChunk>>>;
}
