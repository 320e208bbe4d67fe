//! Shell command runner: each node's `config.command` runs under the configured shell.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weaver_core::config::RunnerConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::{AgentRequest, AgentRunner, RunnerChunk};

pub struct ShellRunner {
    shell: String,
    working_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct ShellNodeConfig {
    command: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

impl ShellRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            working_dir: config.working_dir(),
        }
    }

    fn command(&self, request: &AgentRequest, config: &ShellNodeConfig) -> Result<Command> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&config.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("WEAVER_EXECUTION_ID", request.execution_id.as_str())
            .env("WEAVER_NODE_ID", &request.node.id)
            .env("WEAVER_ATTEMPT", request.attempt.to_string())
            .env("WEAVER_VARIABLES", serde_json::to_string(&request.variables)?);
        if let Some(work_item) = &request.work_item {
            cmd.env("WEAVER_WORK_ITEM", serde_json::to_string(work_item)?);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&config.env);
        Ok(cmd)
    }
}

struct Running {
    child: Child,
    lines: BoxStream<'static, RunnerChunk>,
    stdout: String,
    cancel: CancellationToken,
}

impl AgentRunner for ShellRunner {
    fn run(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<BoxStream<'static, RunnerChunk>>> {
        Box::pin(async move {
            let config: ShellNodeConfig = serde_json::from_value(request.resolved_config.clone())
                .map_err(|e| {
                    WeaverError::Runner(format!(
                        "node {} has no runnable command: {}",
                        request.node.id, e
                    ))
                })?;
            debug!(node_id = %request.node.id, command = %config.command, "Spawning shell command");

            let mut child = self.command(&request, &config)?.spawn()?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| WeaverError::Runner("stdout not captured".into()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| WeaverError::Runner("stderr not captured".into()))?;
            let lines = stream::select(
                read_lines(stdout, RunnerChunk::Stdout),
                read_lines(stderr, RunnerChunk::Stderr),
            )
            .boxed();

            let running = Running {
                child,
                lines,
                stdout: String::new(),
                cancel,
            };
            Ok(stream::unfold(Some(running), next_chunk).boxed())
        })
    }
}

async fn next_chunk(state: Option<Running>) -> Option<(RunnerChunk, Option<Running>)> {
    let mut run = state?;
    tokio::select! {
        _ = run.cancel.cancelled() => {
            let _ = run.child.kill().await;
            None
        }
        next = run.lines.next() => match next {
            Some(chunk) => {
                if let RunnerChunk::Stdout(text) = &chunk {
                    run.stdout.push_str(text);
                }
                Some((chunk, Some(run)))
            }
            None => {
                let exit = match run.child.wait().await {
                    Ok(status) if status.success() => RunnerChunk::success(parse_output(&run.stdout)),
                    Ok(status) => {
                        let code = status.code().unwrap_or(-1);
                        RunnerChunk::failure(code, format!("command exited with code {}", code))
                    }
                    Err(e) => RunnerChunk::failure(-1, e.to_string()),
                };
                Some((exit, None))
            }
        }
    }
}

fn read_lines<R>(reader: R, wrap: fn(String) -> RunnerChunk) -> BoxStream<'static, RunnerChunk>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(BufReader::new(reader).lines(), move |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((wrap(format!("{}\n", line)), lines)),
            _ => None,
        }
    })
    .boxed()
}

/// Stdout that parses as JSON becomes structured output; anything else is kept as text.
fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weaver_core::definition::{AgentNode, NodeType};
    use weaver_core::types::ExecutionId;

    fn request(command: &str) -> AgentRequest {
        AgentRequest {
            execution_id: ExecutionId::new(),
            node: AgentNode::new("n", NodeType::Custom),
            resolved_config: json!({ "command": command }),
            variables: BTreeMap::from([("ticket".to_string(), json!("WV-7"))]),
            work_item: None,
            attempt: 1,
        }
    }

    fn runner() -> ShellRunner {
        ShellRunner::new(&RunnerConfig::default())
    }

    #[test]
    fn output_parsing() {
        assert_eq!(parse_output(""), Value::Null);
        assert_eq!(parse_output("{\"ok\": true}\n"), json!({ "ok": true }));
        assert_eq!(parse_output("plain text\n"), json!("plain text"));
    }

    #[tokio::test]
    async fn streams_output_and_exit() {
        let chunks: Vec<RunnerChunk> = runner()
            .run(request("echo hello; echo oops >&2"), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(chunks.contains(&RunnerChunk::Stdout("hello\n".into())));
        assert!(chunks.contains(&RunnerChunk::Stderr("oops\n".into())));
        assert_eq!(chunks.last(), Some(&RunnerChunk::success(json!("hello"))));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let chunks: Vec<RunnerChunk> = runner()
            .run(request("echo $WEAVER_NODE_ID; exit 3"), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks[0], RunnerChunk::Stdout("n\n".into()));
        assert_eq!(
            chunks.last(),
            Some(&RunnerChunk::failure(3, "command exited with code 3"))
        );
    }

    #[tokio::test]
    async fn missing_command_is_rejected() {
        let mut req = request("true");
        req.resolved_config = json!({});
        let err = runner().run(req, CancellationToken::new()).await.err().unwrap();
        assert!(err.to_string().contains("no runnable command"));
    }

    #[tokio::test]
    async fn cancel_stops_the_stream() {
        let cancel = CancellationToken::new();
        let mut stream = runner()
            .run(request("sleep 30"), cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        assert_eq!(stream.next().await, None);
    }
}
