//! Execution state machine.
//!
//! An `Execution` owns the control state of one run behind a single async
//! mutex. Operator calls, node completions and gate timers all commit through
//! that lock, and events are appended inside the same critical section, so
//! the order of sequence numbers is the order in which transitions were
//! committed. Node work runs in spawned tasks that hold no lock while the
//! runner is outstanding.

mod state;
mod worker;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weaver_core::config::AppConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::{ConnectedSnapshot, EventKind, ExecutionEvent, StreamFrame};
use weaver_core::traits::{AgentRequest, AgentRunner};
use weaver_core::types::{
    ExecutionId, ExecutionSnapshot, ExecutionStatus, ExecutionSummary, GateDecisionResult,
    GateInstance, StartedExecution, StatusChange,
};

use crate::gate::SYSTEM_DECIDER;
use crate::lane::LaneTable;
use crate::resolve::resolve_config;
use crate::stream::{EventSubscription, ReplaySource};
use crate::validator::CompiledWorkflow;
use crate::variables::VariableStore;

use state::{ExecutionState, GateTimer};

/// How a node's task ended.
pub(crate) enum NodeResult {
    Succeeded { output: Value, duration_ms: u64 },
    Failed { error: String, attempt: u32 },
}

/// One running (or finished) workflow execution.
pub struct Execution {
    id: ExecutionId,
    workflow: Arc<CompiledWorkflow>,
    runner: Arc<dyn AgentRunner>,
    config: Arc<AppConfig>,
    work_item: Option<Value>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<ExecutionState>,
    tasks: watch::Sender<usize>,
    status: watch::Sender<ExecutionStatus>,
}

impl Execution {
    pub fn new(
        workflow: CompiledWorkflow,
        variables: VariableStore,
        runner: Arc<dyn AgentRunner>,
        config: Arc<AppConfig>,
        work_item: Option<Value>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let started_at = Utc::now();
        let (tasks, _) = watch::channel(0);
        let (status, _) = watch::channel(ExecutionStatus::Pending);
        let state = ExecutionState::new(
            &workflow,
            variables,
            LaneTable::new(cancel.child_token()),
            &config,
            started_at,
        );
        Arc::new(Self {
            id: ExecutionId::new(),
            workflow: Arc::new(workflow),
            runner,
            config,
            work_item,
            started_at,
            cancel,
            state: Mutex::new(state),
            tasks,
            status,
        })
    }

    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow.definition().id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Last committed status; never blocks.
    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ExecutionStatus> {
        self.status.subscribe()
    }

    /// Resolve once the execution reaches a terminal status.
    pub async fn wait_terminal(&self) -> ExecutionStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(ExecutionStatus::is_terminal).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// Move to running and launch the entry nodes.
    pub async fn start(self: &Arc<Self>) -> StartedExecution {
        let mut state = self.state.lock().await;
        let entries = state.start(&self.workflow);
        info!(
            execution_id = %self.id,
            workflow_id = %self.workflow_id(),
            entries = ?entries,
            "Execution started"
        );
        self.drive(&mut state);
        StartedExecution {
            execution_id: self.id.clone(),
            status: state.status(),
            started_at: self.started_at,
            current_node_id: entries.first().cloned(),
            entry_node_ids: entries,
        }
    }

    /// Stop scheduling new nodes. In-flight nodes keep running.
    pub async fn pause(&self) -> Result<StatusChange> {
        let mut state = self.state.lock().await;
        match state.status() {
            ExecutionStatus::Paused => return Ok(self.status_change(&state)),
            ExecutionStatus::Running => {}
            status => {
                return Err(WeaverError::InvalidState {
                    operation: "pause",
                    status,
                })
            }
        }
        state.paused = true;
        state.emit(None, EventKind::ExecutionPaused);
        info!(execution_id = %self.id, "Execution paused");
        self.publish(&state);
        Ok(self.status_change(&state))
    }

    pub async fn resume(self: &Arc<Self>) -> Result<StatusChange> {
        let mut state = self.state.lock().await;
        let status = state.status();
        if status != ExecutionStatus::Paused {
            return Err(WeaverError::InvalidState {
                operation: "resume",
                status,
            });
        }
        state.paused = false;
        state.emit(None, EventKind::ExecutionResumed);
        info!(execution_id = %self.id, "Execution resumed");
        self.drive(&mut state);
        Ok(self.status_change(&state))
    }

    /// Cancel every lane and end the execution as aborted.
    ///
    /// Returns once every runner has stopped or the abort grace period has
    /// elapsed; runners still going by then are force-failed. The grace wait
    /// and the closing `stream_end` run on their own task, so dropping the
    /// returned future does not leave the stream open.
    pub async fn abort(self: &Arc<Self>, reason: Option<String>) -> Result<StatusChange> {
        {
            let mut state = self.state.lock().await;
            if let Some(status) = state.terminal {
                return Err(WeaverError::InvalidState {
                    operation: "abort",
                    status,
                });
            }
            info!(execution_id = %self.id, reason = ?reason, "Aborting execution");
            state.abort(reason);
            self.cancel.cancel();
            self.publish(&state);
        }

        let exec = Arc::clone(self);
        let closer = tokio::spawn(async move { exec.finish_abort().await });
        if let Err(e) = closer.await {
            warn!(execution_id = %self.id, error = %e, "Abort close task failed");
        }

        let state = self.state.lock().await;
        Ok(self.status_change(&state))
    }

    async fn finish_abort(&self) {
        let grace = self.config.engine.abort_grace();
        let mut tasks = self.tasks.subscribe();
        if tokio::time::timeout(grace, tasks.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            warn!(execution_id = %self.id, grace_secs = grace.as_secs(), "Abort grace period elapsed");
        }

        let mut state = self.state.lock().await;
        state.close_aborted(grace);
        self.publish(&state);
    }

    /// Record a human decision on a pending gate and release its node.
    ///
    /// Every check runs before anything is mutated; a rejected decision
    /// leaves the gate pending and emits nothing.
    pub async fn decide_gate(
        self: &Arc<Self>,
        gate_id: &str,
        node_id: &str,
        option: &str,
        decided_by: &str,
        reason: Option<String>,
    ) -> Result<GateDecisionResult> {
        let mut state = self.state.lock().await;
        let def = self
            .workflow
            .definition()
            .gate(gate_id)
            .ok_or_else(|| WeaverError::GateNotFound(gate_id.to_string()))?;
        if let Some(status) = state.terminal {
            return Err(WeaverError::InvalidState {
                operation: "decide gate for",
                status,
            });
        }
        state.gates.check_decision(Some(def), gate_id, node_id, option)?;

        let targets = state.apply_decision(&self.workflow, gate_id, option, decided_by, reason, false);
        self.drive(&mut state);
        Ok(GateDecisionResult {
            execution_id: self.id.clone(),
            status: state.status(),
            next_node_id: targets.into_iter().next(),
        })
    }

    pub async fn gates(&self) -> Vec<GateInstance> {
        self.state.lock().await.gates.instances().to_vec()
    }

    pub async fn snapshot(&self) -> ExecutionSnapshot {
        let state = self.state.lock().await;
        ExecutionSnapshot {
            execution_id: self.id.clone(),
            workflow_id: self.workflow_id().to_string(),
            status: state.status(),
            current_node_id: state.current_node_id.clone(),
            current_lane_ids: state.lanes.active_ids(),
            node_states: state.nodes.clone(),
            variables: (*state.variables.snapshot()).clone(),
            gates: state.gates.instances().to_vec(),
            events: state.log.all(),
            work_item: self.work_item.clone(),
            started_at: self.started_at,
            ended_at: state.ended_at,
            error: state.error.clone(),
        }
    }

    pub async fn summary(&self) -> ExecutionSummary {
        let state = self.state.lock().await;
        ExecutionSummary {
            execution_id: self.id.clone(),
            workflow_id: self.workflow_id().to_string(),
            status: state.status(),
            current_node_id: state.current_node_id.clone(),
            started_at: self.started_at,
            ended_at: state.ended_at,
        }
    }

    /// Subscribe to the event stream after `last_event_id`.
    ///
    /// Without a cursor the stream starts live from the current position,
    /// except that an ended stream still delivers its final `stream_end`.
    /// A cursor at or beyond `stream_end` is rejected.
    pub async fn subscribe(&self, last_event_id: Option<u64>) -> Result<EventSubscription> {
        let state = self.state.lock().await;
        let last_id = state.log.last_id();
        let end_id = state.log.end_id();
        if let (Some(end), Some(cursor)) = (end_id, last_event_id) {
            if cursor >= end {
                return Err(WeaverError::StreamClosed(self.id.to_string()));
            }
        }
        let cursor = last_event_id.unwrap_or_else(|| end_id.map_or(last_id, |end| end - 1));
        Ok(EventSubscription {
            connected: ConnectedSnapshot {
                execution_id: self.id.to_string(),
                status: state.status(),
                node_states: state.nodes.clone(),
                variables: (*state.variables.snapshot()).clone(),
                started_at: self.started_at,
                last_event_id: last_id,
                retry_ms: self.config.stream.retry_ms,
            },
            backlog: state.log.since(cursor),
            receiver: state.log.subscribe(),
            cursor,
        })
    }

    /// Frame stream for `subscribe`, with heartbeats per the stream config.
    pub async fn event_stream(
        self: &Arc<Self>,
        last_event_id: Option<u64>,
    ) -> Result<BoxStream<'static, StreamFrame>> {
        let subscription = self.subscribe(last_event_id).await?;
        let source: Arc<dyn ReplaySource> = self.clone();
        Ok(subscription.into_frames(source, self.config.stream.heartbeat()))
    }

    fn status_change(&self, state: &ExecutionState) -> StatusChange {
        StatusChange {
            execution_id: self.id.clone(),
            status: state.status(),
            timestamp: Utc::now(),
        }
    }

    fn publish(&self, state: &ExecutionState) {
        self.tasks.send_replace(state.active_tasks);
        self.status.send_replace(state.status());
    }

    /// Start whatever may start, close the execution if nothing is left, publish status.
    fn drive(self: &Arc<Self>, state: &mut ExecutionState) {
        let max = self.config.engine.max_concurrent_nodes;
        while let Some(node_id) = state.next_ready(max) {
            self.launch(state, &node_id);
        }
        if state.is_finished() {
            let status = state.finalize();
            info!(execution_id = %self.id, %status, "Execution finished");
            self.cancel.cancel();
        }
        self.publish(state);
    }

    fn launch(self: &Arc<Self>, state: &mut ExecutionState, node_id: &str) {
        let Some((attempt, slot)) = state.begin_node(&self.workflow, node_id) else {
            warn!(execution_id = %self.id, node_id, "Queued node missing from workflow");
            return;
        };
        let Some(request) = self.request_for(state, node_id, attempt) else {
            return;
        };
        if let Some(session_id) = self.runner.session_id(&request) {
            if let Some(node) = state.nodes.get_mut(node_id) {
                node.session_id = Some(session_id);
            }
        }
        info!(execution_id = %self.id, node_id, attempt, lane_id = %slot.lane_id, "Node started");
        tokio::spawn(worker::run_node(Arc::clone(self), request, slot));
    }

    fn request_for(&self, state: &ExecutionState, node_id: &str, attempt: u32) -> Option<AgentRequest> {
        let node = self.workflow.definition().node(node_id)?;
        let variables = state.variables.snapshot();
        Some(AgentRequest {
            execution_id: self.id.clone(),
            node: node.clone(),
            resolved_config: resolve_config(&node.config, &variables),
            variables: (*variables).clone(),
            work_item: self.work_item.clone(),
            attempt,
        })
    }

    fn arm_gate_timer(self: &Arc<Self>, timer: GateTimer) {
        let exec = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timer.after) => {
                    exec.on_gate_timeout(&timer.gate_id, timer.generation).await;
                }
            }
        });
    }

    async fn on_gate_timeout(self: &Arc<Self>, gate_id: &str, generation: u64) {
        let mut state = self.state.lock().await;
        if state.terminal.is_some() || !state.gates.is_current(gate_id, generation) {
            return;
        }
        let default = self
            .workflow
            .definition()
            .gate(gate_id)
            .and_then(|g| g.default_option())
            .map(|o| o.value.clone());
        match default {
            Some(option) => {
                info!(execution_id = %self.id, gate_id, option = %option, "Gate timed out, applying default");
                state.apply_decision(
                    &self.workflow,
                    gate_id,
                    &option,
                    SYSTEM_DECIDER,
                    Some("timeout".to_string()),
                    true,
                );
            }
            None => state.expire_gate(&self.workflow, gate_id),
        }
        self.drive(&mut state);
    }

    /// Forward coalesced CLI output of a running node.
    pub(crate) async fn emit_output(&self, node_id: &str, events: Vec<EventKind>) {
        if events.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for kind in events {
            state.emit(Some(node_id), kind);
        }
    }

    /// Announce a retry. Returns false when the execution no longer accepts one.
    pub(crate) async fn note_retry(&self, node_id: &str, error: &str, attempt: u32) -> bool {
        let mut state = self.state.lock().await;
        if state.terminal.is_some() {
            return false;
        }
        warn!(execution_id = %self.id, node_id, attempt, error, "Node attempt failed, will retry");
        state.retry_pending(node_id, error, attempt);
        true
    }

    /// Begin the next attempt of a retrying node.
    pub(crate) async fn restart(&self, node_id: &str) -> Option<AgentRequest> {
        let mut state = self.state.lock().await;
        let attempt = state.restart_node(&self.workflow, node_id)?;
        self.request_for(&state, node_id, attempt)
    }

    /// Final call of a node task.
    pub(crate) async fn finish_node(self: &Arc<Self>, node_id: &str, result: NodeResult) {
        let mut state = self.state.lock().await;
        state.task_finished(node_id);
        match result {
            NodeResult::Succeeded { output, duration_ms } => {
                info!(execution_id = %self.id, node_id, duration_ms, "Node succeeded");
                if let Some(timer) = state.runner_succeeded(&self.workflow, node_id, output, duration_ms) {
                    self.arm_gate_timer(timer);
                }
            }
            NodeResult::Failed { error, attempt } => {
                warn!(execution_id = %self.id, node_id, attempt, error = %error, "Node failed");
                state.fail_node(&self.workflow, node_id, &error, attempt);
            }
        }
        self.drive(&mut state);
    }
}

impl ReplaySource for Execution {
    fn replay_after(&self, after: u64) -> BoxFuture<'_, Vec<ExecutionEvent>> {
        Box::pin(async move { self.state.lock().await.log.since(after) })
    }
}
