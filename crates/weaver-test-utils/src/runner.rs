use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::{AgentRequest, AgentRunner, RunnerChunk};

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum Step {
    Emit(RunnerChunk),
    Delay(Duration),
    /// Never produce anything else.
    Hang,
}

/// What one runner attempt does.
#[derive(Debug, Clone)]
pub struct Script {
    steps: Vec<Step>,
    ignore_cancel: bool,
    start_error: Option<String>,
}

impl Script {
    /// Empty script; add steps with the builder methods.
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            ignore_cancel: false,
            start_error: None,
        }
    }

    pub fn succeed(output: Value) -> Self {
        Self::new().exit_ok(output)
    }

    pub fn fail(error: &str) -> Self {
        Self::new().exit_err(1, error)
    }

    pub fn hang() -> Self {
        Self::new().then_hang()
    }

    /// `run` itself returns an error instead of a stream.
    pub fn refuse(error: &str) -> Self {
        Self {
            start_error: Some(error.to_string()),
            ..Self::new()
        }
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.steps.push(Step::Emit(RunnerChunk::Stdout(text.to_string())));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.steps.push(Step::Emit(RunnerChunk::Stderr(text.to_string())));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Delay(duration));
        self
    }

    pub fn delay_secs(self, secs: u64) -> Self {
        self.delay(Duration::from_secs(secs))
    }

    pub fn exit_ok(mut self, output: Value) -> Self {
        self.steps.push(Step::Emit(RunnerChunk::success(output)));
        self
    }

    pub fn exit_err(mut self, exit_code: i32, error: &str) -> Self {
        self.steps.push(Step::Emit(RunnerChunk::failure(exit_code, error)));
        self
    }

    pub fn then_hang(mut self) -> Self {
        self.steps.push(Step::Hang);
        self
    }

    /// Keep going after cancellation, like a runner that never checks its token.
    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::succeed(Value::Null)
    }
}

/// Runner that plays back scripts keyed by node id.
///
/// Each node has a queue of scripts, one per attempt; the last script is
/// reused once the queue is down to one. Nodes without a script succeed
/// immediately with `null` output.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<AgentRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script every attempt of `node_id`.
    pub fn with(self, node_id: &str, script: Script) -> Self {
        self.with_attempts(node_id, vec![script])
    }

    /// Script successive attempts of `node_id`.
    pub fn with_attempts(self, node_id: &str, scripts: Vec<Script>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(node_id.to_string(), scripts.into());
        self
    }

    /// Every request seen so far, in call order.
    pub fn calls(&self) -> Vec<AgentRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, node_id: &str) -> Vec<AgentRequest> {
        self.calls()
            .into_iter()
            .filter(|r| r.node.id == node_id)
            .collect()
    }

    /// Node ids in the order they were started.
    pub fn started_nodes(&self) -> Vec<String> {
        self.calls().into_iter().map(|r| r.node.id).collect()
    }

    fn next_script(&self, node_id: &str) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(node_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => Script::default(),
        }
    }
}

impl AgentRunner for ScriptedRunner {
    fn session_id(&self, request: &AgentRequest) -> Option<String> {
        Some(format!("scripted-{}-{}", request.node.id, request.attempt))
    }

    fn run(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<BoxStream<'static, RunnerChunk>>> {
        Box::pin(async move {
            let script = self.next_script(&request.node.id);
            self.calls.lock().unwrap().push(request);
            if let Some(error) = script.start_error {
                return Err(WeaverError::Runner(error));
            }
            let steps: VecDeque<Step> = script.steps.into();
            Ok(play(steps, cancel, script.ignore_cancel))
        })
    }
}

fn play(
    steps: VecDeque<Step>,
    cancel: CancellationToken,
    ignore_cancel: bool,
) -> BoxStream<'static, RunnerChunk> {
    stream::unfold((steps, cancel), move |(mut steps, cancel)| async move {
        loop {
            match steps.pop_front()? {
                Step::Emit(chunk) => return Some((chunk, (steps, cancel))),
                Step::Delay(duration) if ignore_cancel => tokio::time::sleep(duration).await,
                Step::Delay(duration) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                Step::Hang if ignore_cancel => std::future::pending::<()>().await,
                Step::Hang => {
                    cancel.cancelled().await;
                    return None;
                }
            }
        }
    })
    .boxed()
}
