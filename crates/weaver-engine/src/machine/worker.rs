use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use weaver_core::error::{Result, WeaverError};
use weaver_core::event::EventKind;
use weaver_core::traits::{AgentRequest, RunnerChunk};

use super::{Execution, NodeResult};
use crate::lane::LaneSlot;
use crate::output::{OutputCoalescer, OutputKind};
use crate::retry;

/// Task body of one node: run attempts until success, final failure or cancellation.
pub(super) async fn run_node(exec: Arc<Execution>, mut request: AgentRequest, slot: LaneSlot) {
    let node_id = request.node.id.clone();
    let timeout = request
        .node
        .timeout_seconds
        .or(exec.config.engine.default_node_timeout_secs)
        .map(Duration::from_secs);
    let policy = request.node.retry.clone();

    loop {
        let attempt = request.attempt;
        let started = Instant::now();
        let error = match run_attempt(&exec, request, &slot, timeout).await {
            Ok(output) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                exec.finish_node(&node_id, NodeResult::Succeeded { output, duration_ms })
                    .await;
                return;
            }
            Err(e) => e,
        };

        let retryable = !matches!(error, WeaverError::Cancelled) && !slot.cancel.is_cancelled();
        let message = match error {
            WeaverError::Runner(message) => message,
            other => other.to_string(),
        };
        let policy = policy
            .as_ref()
            .filter(|p| retryable && retry::should_retry(Some(*p), attempt));
        if let Some(policy) = policy {
            if exec.note_retry(&node_id, &message, attempt).await {
                let delay = retry::backoff(policy, attempt);
                debug!(node_id = %node_id, attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                let cancelled = tokio::select! {
                    _ = slot.cancel.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if !cancelled {
                    if let Some(next) = exec.restart(&node_id).await {
                        request = next;
                        continue;
                    }
                }
                let error = WeaverError::Cancelled.to_string();
                exec.finish_node(&node_id, NodeResult::Failed { error, attempt })
                    .await;
                return;
            }
        }

        exec.finish_node(
            &node_id,
            NodeResult::Failed {
                error: message,
                attempt,
            },
        )
        .await;
        return;
    }
}

enum Step {
    Chunk(Option<RunnerChunk>),
    Dormant,
    Flush,
    TimedOut,
    Cancelled,
}

/// One runner invocation: stream its output, enforce timeout and dormancy.
async fn run_attempt(
    exec: &Arc<Execution>,
    request: AgentRequest,
    slot: &LaneSlot,
    timeout: Option<Duration>,
) -> Result<Value> {
    let node_id = request.node.id.clone();
    // Scoped to this attempt so a timeout stops the runner without cancelling the lane
    let cancel = slot.cancel.child_token();
    let _stop_runner = cancel.clone().drop_guard();
    let deadline = timeout.map(|t| Instant::now() + t);

    let mut stream: BoxStream<'static, RunnerChunk> = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(WeaverError::Cancelled),
        _ = sleep_until(deadline) => return Err(timed_out(&node_id, timeout)),
        started = exec.runner.run(request, cancel.clone()) => started?,
    };

    let mut output = OutputCoalescer::new(exec.config.engine.coalesce_window());
    let result = loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            _ = sleep_until(deadline) => Step::TimedOut,
            _ = sleep_until(output.next_deadline()) => Step::Flush,
            next = next_chunk(&mut stream, slot.dormancy) => next,
        };

        match step {
            Step::Cancelled => break Err(WeaverError::Cancelled),
            Step::TimedOut => break Err(timed_out(&node_id, timeout)),
            Step::Dormant => {
                let secs = slot.dormancy.map_or(0, |d| d.as_secs());
                break Err(WeaverError::Runner(format!(
                    "no output in lane {} for {}s",
                    slot.lane_id, secs
                )));
            }
            Step::Flush => {
                exec.emit_output(&node_id, output.flush_due(Instant::now())).await;
            }
            Step::Chunk(None) => {
                break Err(WeaverError::Runner(
                    "runner stream ended without an exit status".to_string(),
                ))
            }
            Step::Chunk(Some(RunnerChunk::Stdout(text))) => {
                let ready = output.push(OutputKind::Stdout, &text, Instant::now());
                exec.emit_output(&node_id, ready.into_iter().collect()).await;
            }
            Step::Chunk(Some(RunnerChunk::Stderr(text))) => {
                let ready = output.push(OutputKind::Stderr, &text, Instant::now());
                exec.emit_output(&node_id, ready.into_iter().collect()).await;
            }
            Step::Chunk(Some(RunnerChunk::Exit {
                exit_code,
                output: result,
                error,
            })) => {
                drain_output(exec, &node_id, &mut output).await;
                exec.emit_output(&node_id, vec![EventKind::CliExit { exit_code }]).await;
                break if exit_code == 0 {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    Err(WeaverError::Runner(
                        error.unwrap_or_else(|| format!("exited with code {}", exit_code)),
                    ))
                };
            }
        }
    };

    drain_output(exec, &node_id, &mut output).await;
    result
}

/// Release buffered output one window at a time until nothing is left.
async fn drain_output(exec: &Execution, node_id: &str, output: &mut OutputCoalescer) {
    loop {
        exec.emit_output(node_id, output.flush_due(Instant::now())).await;
        match output.next_deadline() {
            Some(at) => tokio::time::sleep_until(at).await,
            None => break,
        }
    }
}

async fn next_chunk(stream: &mut BoxStream<'static, RunnerChunk>, dormancy: Option<Duration>) -> Step {
    match dormancy {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(chunk) => Step::Chunk(chunk),
            Err(_) => Step::Dormant,
        },
        None => Step::Chunk(stream.next().await),
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn timed_out(node_id: &str, timeout: Option<Duration>) -> WeaverError {
    WeaverError::NodeTimeout {
        node_id: node_id.to_string(),
        timeout_secs: timeout.map_or(0, |t| t.as_secs()),
    }
}
