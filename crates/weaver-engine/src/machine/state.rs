//! Control state of one execution and its synchronous transitions.
//!
//! Every method here runs with the execution lock held. Nothing in this file
//! awaits; the async driver in `mod.rs` locks, calls into this state, and then
//! spawns whatever work the transition made ready.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use weaver_core::config::AppConfig;
use weaver_core::event::{EventKind, ExecutionEvent};
use weaver_core::types::{
    ExecutionStatus, GateDecision, NodeExecutionState, NodeStatus, SkipReason,
};

use crate::events::EventLog;
use crate::gate::GateController;
use crate::lane::{LaneSlot, LaneTable};
use crate::transition::{self, Outcome, RouteContext};
use crate::validator::CompiledWorkflow;
use crate::variables::VariableStore;

/// A gate timer to arm after the lock is released.
#[derive(Debug, Clone)]
pub(crate) struct GateTimer {
    pub gate_id: String,
    pub generation: u64,
    pub after: Duration,
}

/// Runner result parked while its node waits on a required gate.
struct ParkedRun {
    output: Value,
    duration_ms: u64,
}

pub(crate) struct ExecutionState {
    pub started: bool,
    pub terminal: Option<ExecutionStatus>,
    pub paused: bool,
    pub nodes: BTreeMap<String, NodeExecutionState>,
    pub variables: VariableStore,
    pub gates: GateController,
    pub log: EventLog,
    pub lanes: LaneTable,
    pub active_tasks: usize,
    pub current_node_id: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    ready: VecDeque<String>,
    fired: HashSet<usize>,
    retry_counts: HashMap<usize, u32>,
    unhandled: BTreeSet<String>,
    parked: HashMap<String, ParkedRun>,
    node_lanes: HashMap<String, String>,
    started_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(
        workflow: &CompiledWorkflow,
        variables: VariableStore,
        lanes: LaneTable,
        config: &AppConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        let nodes = workflow
            .definition()
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeExecutionState::pending(n.id.clone())))
            .collect();
        Self {
            started: false,
            terminal: None,
            paused: false,
            nodes,
            variables,
            gates: GateController::default(),
            log: EventLog::new(config.stream.replay_capacity, config.stream.broadcast_capacity),
            lanes,
            active_tasks: 0,
            current_node_id: None,
            ended_at: None,
            error: None,
            ready: VecDeque::new(),
            fired: HashSet::new(),
            retry_counts: HashMap::new(),
            unhandled: BTreeSet::new(),
            parked: HashMap::new(),
            node_lanes: HashMap::new(),
            started_at,
        }
    }

    pub fn emit(&mut self, node_id: Option<&str>, kind: EventKind) -> Option<ExecutionEvent> {
        self.log.append(node_id, kind)
    }

    /// Overall status. Non-terminal status is derived from the pause flag and pending gates.
    pub fn status(&self) -> ExecutionStatus {
        if let Some(terminal) = self.terminal {
            return terminal;
        }
        if !self.started {
            ExecutionStatus::Pending
        } else if self.paused {
            ExecutionStatus::Paused
        } else if self.gates.has_blocking() {
            ExecutionStatus::WaitingGate
        } else {
            ExecutionStatus::Running
        }
    }

    /// Queue the entry nodes and move to running.
    pub fn start(&mut self, workflow: &CompiledWorkflow) -> Vec<String> {
        let def = workflow.definition();
        let entries: Vec<String> = def.entry_nodes().iter().map(|n| n.id.clone()).collect();
        self.started = true;
        self.emit(
            None,
            EventKind::ExecutionStarted {
                workflow_id: def.id.clone(),
                entry_node_ids: entries.clone(),
            },
        );
        self.ready.extend(entries.iter().cloned());
        entries
    }

    /// Next queued node allowed to start now, if any.
    pub fn next_ready(&mut self, max_concurrent: usize) -> Option<String> {
        if self.terminal.is_some() || self.paused || self.gates.has_blocking() {
            return None;
        }
        if max_concurrent > 0 && self.active_tasks >= max_concurrent {
            return None;
        }
        self.ready.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Mark a node running and emit `node_started`.
    pub fn begin_node(&mut self, workflow: &CompiledWorkflow, node_id: &str) -> Option<(u32, LaneSlot)> {
        let node = workflow.definition().node(node_id)?;
        let slot = self.lanes.enter(workflow.definition(), node_id);
        let state = self.nodes.get_mut(node_id)?;
        state.status = NodeStatus::Running;
        state.attempt += 1;
        state.started_at = Some(Utc::now());
        state.ended_at = None;
        state.error = None;
        let attempt = state.attempt;

        self.active_tasks += 1;
        self.node_lanes.insert(node_id.to_string(), slot.lane_id.clone());
        self.current_node_id = Some(node_id.to_string());
        self.emit(
            Some(node_id),
            EventKind::NodeStarted {
                node_type: node.node_type.to_string(),
                attempt,
                lane_id: slot.lane_id.clone(),
            },
        );
        Some((attempt, slot))
    }

    /// Record a failed attempt that will be retried.
    pub fn retry_pending(&mut self, node_id: &str, error: &str, attempt: u32) {
        if let Some(state) = self.nodes.get_mut(node_id) {
            state.error = Some(error.to_string());
        }
        self.emit(
            Some(node_id),
            EventKind::NodeFailed {
                error: error.to_string(),
                attempt,
                will_retry: true,
            },
        );
    }

    /// Start the next attempt of a node whose task is still alive.
    pub fn restart_node(&mut self, workflow: &CompiledWorkflow, node_id: &str) -> Option<u32> {
        if self.terminal.is_some() {
            return None;
        }
        let node = workflow.definition().node(node_id)?;
        let lane_id = self.node_lanes.get(node_id)?.clone();
        let state = self.nodes.get_mut(node_id)?;
        if state.status != NodeStatus::Running {
            return None;
        }
        state.attempt += 1;
        state.started_at = Some(Utc::now());
        let attempt = state.attempt;
        self.emit(
            Some(node_id),
            EventKind::NodeStarted {
                node_type: node.node_type.to_string(),
                attempt,
                lane_id,
            },
        );
        Some(attempt)
    }

    /// Release the task slot and lane membership of a node.
    pub fn task_finished(&mut self, node_id: &str) {
        self.active_tasks = self.active_tasks.saturating_sub(1);
        if let Some(lane_id) = self.node_lanes.remove(node_id) {
            self.lanes.leave(&lane_id);
        }
    }

    /// The runner succeeded. Opens the node's gate if it has one; a required
    /// gate parks the result until decided, otherwise the node completes now.
    pub fn runner_succeeded(
        &mut self,
        workflow: &CompiledWorkflow,
        node_id: &str,
        output: Value,
        duration_ms: u64,
    ) -> Option<GateTimer> {
        if !self.is_running(node_id) {
            return None;
        }
        let gate_def = if self.terminal.is_none() {
            workflow.definition().gate_for_node(node_id).cloned()
        } else {
            None
        };
        let Some(gate_def) = gate_def else {
            self.complete_node(workflow, node_id, output, duration_ms, None);
            return None;
        };

        let (event, generation) = self.gates.open(&gate_def);
        self.emit(Some(node_id), event);
        let timer = gate_def.timeout_seconds.map(|secs| GateTimer {
            gate_id: gate_def.id.clone(),
            generation,
            after: Duration::from_secs(secs),
        });

        if gate_def.required {
            info!(node_id, gate_id = %gate_def.id, "Node waiting on gate");
            if let Some(state) = self.nodes.get_mut(node_id) {
                state.status = NodeStatus::WaitingGate;
                state.output = Some(output.clone());
            }
            self.parked.insert(node_id.to_string(), ParkedRun { output, duration_ms });
        } else {
            self.complete_node(workflow, node_id, output, duration_ms, None);
        }
        timer
    }

    /// Apply a gate decision. Validation happened before this call.
    ///
    /// Returns the nodes the release routed to.
    pub fn apply_decision(
        &mut self,
        workflow: &CompiledWorkflow,
        gate_id: &str,
        option: &str,
        decided_by: &str,
        reason: Option<String>,
        auto_resolved: bool,
    ) -> Vec<String> {
        let Some((decision, event)) = self.gates.decide(gate_id, option, decided_by, reason, auto_resolved)
        else {
            return vec![];
        };
        let node_id = self
            .gates
            .get(gate_id)
            .map(|g| g.node_id.clone())
            .unwrap_or_default();
        self.emit(Some(&node_id), event);
        info!(node_id = %node_id, gate_id, option, decided_by, auto_resolved, "Gate decided");

        match self.parked.remove(&node_id) {
            Some(run) => self.complete_node(workflow, &node_id, run.output, run.duration_ms, Some(&decision)),
            None => vec![],
        }
    }

    /// A gate timer fired with no decision and no default option.
    pub fn expire_gate(&mut self, workflow: &CompiledWorkflow, gate_id: &str) {
        if !self.gates.expire(gate_id) {
            return;
        }
        let Some(node_id) = self.gates.get(gate_id).map(|g| g.node_id.clone()) else {
            return;
        };
        warn!(node_id = %node_id, gate_id, "Gate expired without a decision");
        if self.parked.remove(&node_id).is_some() {
            let attempt = self.nodes.get(&node_id).map_or(1, |n| n.attempt);
            self.fail_node(
                workflow,
                &node_id,
                &format!("gate {} expired without a decision", gate_id),
                attempt,
            );
        }
    }

    fn complete_node(
        &mut self,
        workflow: &CompiledWorkflow,
        node_id: &str,
        output: Value,
        duration_ms: u64,
        decision: Option<&GateDecision>,
    ) -> Vec<String> {
        if let Some(state) = self.nodes.get_mut(node_id) {
            state.status = NodeStatus::Completed;
            state.ended_at = Some(Utc::now());
            state.output = Some(output.clone());
            state.error = None;
        }
        self.emit(
            Some(node_id),
            EventKind::NodeCompleted {
                output: output.clone(),
                duration_ms,
            },
        );
        if self.terminal.is_some() {
            return vec![];
        }
        self.bind_outputs(workflow, node_id, &output);
        self.route(workflow, node_id, Outcome::Success, Some(&output), decision)
    }

    /// Mark a node failed and route the failure.
    pub fn fail_node(&mut self, workflow: &CompiledWorkflow, node_id: &str, error: &str, attempt: u32) {
        let Some(state) = self.nodes.get_mut(node_id) else {
            return;
        };
        if state.status.is_terminal() {
            return;
        }
        state.status = NodeStatus::Failed;
        state.ended_at = Some(Utc::now());
        state.error = Some(error.to_string());
        self.parked.remove(node_id);
        self.emit(
            Some(node_id),
            EventKind::NodeFailed {
                error: error.to_string(),
                attempt,
                will_retry: false,
            },
        );
        if self.terminal.is_none() {
            self.route(workflow, node_id, Outcome::Failure, None, None);
        }
    }

    fn is_running(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .is_some_and(|n| n.status == NodeStatus::Running)
    }

    /// Copy output ports that name declared variables into the variable store.
    fn bind_outputs(&mut self, workflow: &CompiledWorkflow, node_id: &str, output: &Value) {
        let Some(node) = workflow.definition().node(node_id) else {
            return;
        };
        for port in &node.outputs {
            if !self.variables.is_declared(&port.name) {
                continue;
            }
            let Some(value) = output.get(&port.name) else {
                continue;
            };
            match self.variables.set(&port.name, value.clone(), Some(node_id)) {
                Ok(event) => {
                    self.emit(Some(node_id), event);
                }
                Err(e) => warn!(node_id, port = %port.name, error = %e, "Output not bound"),
            }
        }
    }

    /// Evaluate outgoing transitions, queue or reset their targets, then settle joins.
    fn route(
        &mut self,
        workflow: &CompiledWorkflow,
        node_id: &str,
        outcome: Outcome,
        output: Option<&Value>,
        gate: Option<&GateDecision>,
    ) -> Vec<String> {
        let variables = self.variables.snapshot();
        let fired = transition::route(
            workflow,
            node_id,
            &RouteContext {
                variables: &variables,
                output,
                gate,
                outcome,
            },
        );

        let mut targets = Vec::new();
        let mut retry_targets = Vec::new();
        for f in fired {
            if f.retry {
                let budget = workflow.definition().transitions[f.index].retry.unwrap_or(0);
                let used = self.retry_counts.entry(f.index).or_insert(0);
                if *used >= budget {
                    warn!(node_id, to = %f.to, budget, "Retry transition budget exhausted");
                    continue;
                }
                *used += 1;
                retry_targets.push(f.to);
            } else {
                self.fired.insert(f.index);
                targets.push(f.to);
            }
        }

        let handled = !targets.is_empty() || !retry_targets.is_empty();
        if outcome == Outcome::Failure && !handled {
            self.unhandled.insert(node_id.to_string());
        }

        for target in &retry_targets {
            self.reset_for_retry(workflow, target);
        }
        self.settle(workflow);

        targets.extend(retry_targets);
        targets.dedup();
        targets
    }

    /// Return `target` and everything forward of it to pending, and queue `target`.
    fn reset_for_retry(&mut self, workflow: &CompiledWorkflow, target: &str) {
        info!(target, "Retry transition fired");
        for id in workflow.forward_closure(target) {
            let Some(state) = self.nodes.get_mut(&id) else {
                continue;
            };
            if state.status.is_active() {
                debug!(node_id = %id, "Active node left alone by retry reset");
                continue;
            }
            let attempt = state.attempt;
            let session_id = state.session_id.take();
            *state = NodeExecutionState::pending(id.clone());
            state.attempt = attempt;
            state.session_id = session_id;

            self.unhandled.remove(&id);
            self.ready.retain(|r| *r != id);
            for (index, t) in workflow.definition().outgoing(&id) {
                if !t.is_retry() {
                    self.fired.remove(&index);
                }
            }
        }
        self.ready.push_back(target.to_string());
    }

    /// Resolve joins: queue pending nodes whose inputs fired, skip those whose inputs cannot.
    fn settle(&mut self, workflow: &CompiledWorkflow) {
        loop {
            let mut changed = false;
            for node in &workflow.definition().nodes {
                let id = node.id.as_str();
                let pending = self
                    .nodes
                    .get(id)
                    .is_some_and(|n| n.status == NodeStatus::Pending);
                if !pending || self.ready.iter().any(|r| r == id) {
                    continue;
                }
                let incoming = workflow.incoming(id);
                if incoming.is_empty() {
                    continue;
                }

                let transitions = &workflow.definition().transitions;
                let mut sources_done = true;
                let mut upstream_failed = false;
                for index in incoming {
                    let source = self.nodes.get(&transitions[*index].from);
                    match source.map(|s| (s.status, s.skip_reason)) {
                        Some((NodeStatus::Failed, _))
                        | Some((NodeStatus::Skipped, Some(SkipReason::UpstreamFailed)))
                        | Some((NodeStatus::Skipped, Some(SkipReason::ExecutionAborted))) => {
                            upstream_failed = true;
                        }
                        Some((status, _)) if status.is_terminal() => {}
                        _ => sources_done = false,
                    }
                }
                if !sources_done {
                    continue;
                }

                if incoming.iter().any(|i| self.fired.contains(i)) {
                    self.ready.push_back(id.to_string());
                } else {
                    let reason = if upstream_failed {
                        SkipReason::UpstreamFailed
                    } else {
                        SkipReason::ConditionNotMet
                    };
                    self.skip_node(id, reason);
                }
                changed = true;
            }
            if !changed {
                break;
            }
        }
    }

    fn skip_node(&mut self, node_id: &str, reason: SkipReason) {
        if let Some(state) = self.nodes.get_mut(node_id) {
            state.status = NodeStatus::Skipped;
            state.skip_reason = Some(reason);
            state.ended_at = Some(Utc::now());
        }
        debug!(node_id, %reason, "Node skipped");
        self.emit(Some(node_id), EventKind::NodeSkipped { reason });
    }

    /// True when nothing is queued, running or waiting.
    pub fn is_finished(&self) -> bool {
        self.terminal.is_none()
            && self.started
            && self.ready.is_empty()
            && self.active_tasks == 0
            && self.nodes.values().all(|n| n.status.is_terminal())
    }

    /// Close a finished execution: skip optional gates, emit the outcome and `stream_end`.
    pub fn finalize(&mut self) -> ExecutionStatus {
        let skipped = self.gates.skip_pending(true);
        if !skipped.is_empty() {
            debug!(gates = ?skipped, "Optional gates skipped at completion");
        }

        let now = Utc::now();
        let status = if self.unhandled.is_empty() {
            let duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
            self.emit(None, EventKind::ExecutionCompleted { duration_ms });
            ExecutionStatus::Completed
        } else {
            let failed: Vec<String> = self.unhandled.iter().cloned().collect();
            let error = format!("unhandled failure in node(s): {}", failed.join(", "));
            self.error = Some(error.clone());
            self.emit(
                None,
                EventKind::ExecutionFailed {
                    error,
                    failed_node_ids: failed,
                },
            );
            ExecutionStatus::Failed
        };

        self.terminal = Some(status);
        self.ended_at = Some(now);
        self.emit(None, EventKind::StreamEnd { final_status: status });
        status
    }

    /// First half of abort: commit `aborted`, skip what has not started, cancel lanes.
    pub fn abort(&mut self, reason: Option<String>) {
        self.terminal = Some(ExecutionStatus::Aborted);
        self.ended_at = Some(Utc::now());
        self.error = reason.clone();
        self.emit(None, EventKind::ExecutionAborted { reason });

        self.ready.clear();
        self.parked.clear();
        let to_skip: Vec<String> = self
            .nodes
            .values()
            .filter(|n| matches!(n.status, NodeStatus::Pending | NodeStatus::WaitingGate))
            .map(|n| n.node_id.clone())
            .collect();
        for id in to_skip {
            self.skip_node(&id, SkipReason::ExecutionAborted);
        }
        self.gates.skip_pending(false);
        self.lanes.cancel_all();
    }

    /// Second half of abort: fail nodes whose runner outlived the grace period, end the stream.
    pub fn close_aborted(&mut self, grace: Duration) {
        let stragglers: Vec<(String, u32)> = self
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Running)
            .map(|n| (n.node_id.clone(), n.attempt))
            .collect();
        for (id, attempt) in stragglers {
            warn!(node_id = %id, grace_secs = grace.as_secs(), "Runner ignored cancellation, force-failing");
            let error = format!("runner did not stop within {}s of abort", grace.as_secs());
            if let Some(state) = self.nodes.get_mut(&id) {
                state.status = NodeStatus::Failed;
                state.ended_at = Some(Utc::now());
                state.error = Some(error.clone());
            }
            self.emit(
                Some(&id),
                EventKind::NodeFailed {
                    error,
                    attempt,
                    will_retry: false,
                },
            );
        }
        self.emit(
            None,
            EventKind::StreamEnd {
                final_status: ExecutionStatus::Aborted,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use weaver_core::definition::*;

    use crate::validator::validate;

    fn state_for(def: &WorkflowDefinition) -> (CompiledWorkflow, ExecutionState) {
        let wf = validate(def).unwrap();
        let vars = VariableStore::seed(def, BTreeMap::new()).unwrap();
        let state = ExecutionState::new(
            &wf,
            vars,
            LaneTable::new(CancellationToken::new()),
            &AppConfig::default(),
            Utc::now(),
        );
        (wf, state)
    }

    /// Drive every queued node to success synchronously.
    fn run_all(wf: &CompiledWorkflow, state: &mut ExecutionState, fail: &[&str]) {
        while let Some(id) = state.next_ready(0) {
            state.begin_node(wf, &id).unwrap();
            state.task_finished(&id);
            if fail.contains(&id.as_str()) {
                state.fail_node(wf, &id, "boom", 1);
            } else {
                state.runner_succeeded(wf, &id, json!({}), 5);
            }
        }
    }

    fn status_of(state: &ExecutionState, id: &str) -> (NodeStatus, Option<SkipReason>) {
        let n = &state.nodes[id];
        (n.status, n.skip_reason)
    }

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "diamond".into(),
            nodes: vec![
                AgentNode::new("a", NodeType::Planner),
                AgentNode::new("b", NodeType::Coder),
                AgentNode::new("c", NodeType::Coder),
                AgentNode::new("d", NodeType::Reviewer),
            ],
            transitions: vec![
                Transition::on_success("a", "b"),
                Transition::on_success("a", "c"),
                Transition::on_success("b", "d"),
                Transition::on_success("c", "d"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn join_waits_for_all_sources() {
        let (wf, mut state) = state_for(&diamond());
        state.start(&wf);
        let a = state.next_ready(0).unwrap();
        state.begin_node(&wf, &a);
        state.task_finished(&a);
        state.runner_succeeded(&wf, &a, json!({}), 1);

        let b = state.next_ready(0).unwrap();
        let c = state.next_ready(0).unwrap();
        assert_eq!((b.as_str(), c.as_str()), ("b", "c"));
        state.begin_node(&wf, &b);
        state.begin_node(&wf, &c);
        state.task_finished(&b);
        state.runner_succeeded(&wf, &b, json!({}), 1);
        assert!(state.next_ready(0).is_none(), "d must wait for c");

        state.task_finished(&c);
        state.runner_succeeded(&wf, &c, json!({}), 1);
        assert_eq!(state.next_ready(0).as_deref(), Some("d"));
    }

    #[test]
    fn failure_skips_downstream_and_fails_execution() {
        let (wf, mut state) = state_for(&diamond());
        state.start(&wf);
        run_all(&wf, &mut state, &["a"]);
        for id in ["b", "c", "d"] {
            assert_eq!(
                status_of(&state, id),
                (NodeStatus::Skipped, Some(SkipReason::UpstreamFailed))
            );
        }
        assert!(state.is_finished());
        assert_eq!(state.finalize(), ExecutionStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("unhandled failure in node(s): a"));
    }

    #[test]
    fn join_still_runs_when_another_branch_fired() {
        let (wf, mut state) = state_for(&diamond());
        state.start(&wf);
        run_all(&wf, &mut state, &["b"]);
        assert_eq!(status_of(&state, "c").0, NodeStatus::Completed);
        assert_eq!(status_of(&state, "d").0, NodeStatus::Completed);
        assert_eq!(state.finalize(), ExecutionStatus::Failed);
    }

    #[test]
    fn failure_route_handles_failure() {
        let def = WorkflowDefinition {
            nodes: vec![
                AgentNode::new("a", NodeType::Coder),
                AgentNode::new("b", NodeType::Tester),
                AgentNode::new("fix", NodeType::Coder),
            ],
            transitions: vec![
                Transition::on_success("a", "b"),
                Transition::on_failure("a", "fix"),
            ],
            ..Default::default()
        };
        let (wf, mut state) = state_for(&def);
        state.start(&wf);
        run_all(&wf, &mut state, &["a"]);
        assert_eq!(status_of(&state, "fix").0, NodeStatus::Completed);
        assert_eq!(
            status_of(&state, "b"),
            (NodeStatus::Skipped, Some(SkipReason::UpstreamFailed))
        );
        assert_eq!(state.finalize(), ExecutionStatus::Completed);
    }

    #[test]
    fn retry_transition_reruns_until_budget_spent() {
        let def = WorkflowDefinition {
            nodes: vec![
                AgentNode::new("code", NodeType::Coder),
                AgentNode::new("test", NodeType::Tester),
            ],
            transitions: vec![
                Transition::on_success("code", "test"),
                Transition::on_failure("test", "code").with_retry_budget(2),
            ],
            ..Default::default()
        };
        let (wf, mut state) = state_for(&def);
        state.start(&wf);
        run_all(&wf, &mut state, &["test"]);

        assert_eq!(state.nodes["code"].attempt, 3);
        assert_eq!(state.nodes["test"].attempt, 3);
        assert_eq!(status_of(&state, "test").0, NodeStatus::Failed);
        assert!(state.is_finished());
        assert_eq!(state.finalize(), ExecutionStatus::Failed);
    }

    #[test]
    fn pause_blocks_new_starts() {
        let (wf, mut state) = state_for(&diamond());
        state.start(&wf);
        state.paused = true;
        assert!(state.next_ready(0).is_none());
        assert_eq!(state.status(), ExecutionStatus::Paused);
        state.paused = false;
        assert_eq!(state.next_ready(0).as_deref(), Some("a"));
    }

    #[test]
    fn concurrency_limit() {
        let def = WorkflowDefinition {
            nodes: vec![
                AgentNode::new("x", NodeType::Custom),
                AgentNode::new("y", NodeType::Custom),
            ],
            ..Default::default()
        };
        let (wf, mut state) = state_for(&def);
        state.start(&wf);
        let x = state.next_ready(1).unwrap();
        state.begin_node(&wf, &x);
        assert!(state.next_ready(1).is_none());
        state.task_finished(&x);
        assert_eq!(state.next_ready(1).as_deref(), Some("y"));
    }

    #[test]
    fn required_gate_parks_node_and_blocks() {
        let mut def = diamond();
        def.gates = vec![HitlGateDefinition::new(
            "ok",
            "a",
            vec![GateOption::new("yes"), GateOption::new("no")],
        )];
        let (wf, mut state) = state_for(&def);
        state.start(&wf);
        let a = state.next_ready(0).unwrap();
        state.begin_node(&wf, &a);
        state.task_finished(&a);
        assert!(state.runner_succeeded(&wf, &a, json!({ "plan": 1 }), 1).is_none());

        assert_eq!(state.nodes["a"].status, NodeStatus::WaitingGate);
        assert_eq!(state.status(), ExecutionStatus::WaitingGate);
        assert!(!state.is_finished());

        let next = state.apply_decision(&wf, "ok", "yes", "carol", None, false);
        assert_eq!(next, vec!["b", "c"]);
        assert_eq!(state.nodes["a"].status, NodeStatus::Completed);
        assert_eq!(state.status(), ExecutionStatus::Running);
    }

    #[test]
    fn abort_skips_pending_and_waiting() {
        let (wf, mut state) = state_for(&diamond());
        state.start(&wf);
        let a = state.next_ready(0).unwrap();
        state.begin_node(&wf, &a);
        state.abort(Some("operator".into()));
        assert_eq!(state.status(), ExecutionStatus::Aborted);
        for id in ["b", "c", "d"] {
            assert_eq!(
                status_of(&state, id),
                (NodeStatus::Skipped, Some(SkipReason::ExecutionAborted))
            );
        }
        assert_eq!(state.nodes["a"].status, NodeStatus::Running);
        state.close_aborted(Duration::from_secs(10));
        assert_eq!(state.nodes["a"].status, NodeStatus::Failed);
        assert!(state.log.is_closed());
    }
}
