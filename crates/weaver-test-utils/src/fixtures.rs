use weaver_core::config::AppConfig;
use weaver_core::definition::{
    AgentNode, GateOption, HitlGateDefinition, NodeType, ParallelGroup, Transition,
    WorkflowDefinition,
};

pub fn node(id: &str) -> AgentNode {
    AgentNode::new(id, NodeType::Coder)
}

pub fn workflow(id: &str, nodes: Vec<AgentNode>, transitions: Vec<Transition>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        nodes,
        transitions,
        ..Default::default()
    }
}

/// `ids[0] -> ids[1] -> ...` joined by `on_success` transitions.
pub fn linear(ids: &[&str]) -> WorkflowDefinition {
    let nodes = ids.iter().map(|id| node(id)).collect();
    let transitions = ids
        .windows(2)
        .map(|pair| Transition::on_success(pair[0], pair[1]))
        .collect();
    workflow("linear", nodes, transitions)
}

/// `a -> {b, c} -> d`.
pub fn diamond() -> WorkflowDefinition {
    workflow(
        "diamond",
        vec![node("a"), node("b"), node("c"), node("d")],
        vec![
            Transition::on_success("a", "b"),
            Transition::on_success("a", "c"),
            Transition::on_success("b", "d"),
            Transition::on_success("c", "d"),
        ],
    )
}

/// `a -> review -> b`, with an approve/reject gate on `review`.
pub fn gated(gate: HitlGateDefinition) -> WorkflowDefinition {
    let mut def = workflow(
        "gated",
        vec![node("a"), node("review"), node("b")],
        vec![
            Transition::on_success("a", "review"),
            Transition::expression("review", "b", "gate.selectedOption == \"approve\""),
        ],
    );
    def.gates.push(gate);
    def
}

/// Gate on `review` offering `approve` and `reject`.
pub fn approval_gate() -> HitlGateDefinition {
    HitlGateDefinition::new(
        "g1",
        "review",
        vec![GateOption::new("approve"), GateOption::new("reject")],
    )
}

/// Two unconnected nodes sharing one parallel group.
pub fn parallel_pair(dormancy_secs: Option<u64>) -> WorkflowDefinition {
    let mut def = workflow("parallel", vec![node("left"), node("right")], vec![]);
    def.parallel_groups.push(ParallelGroup {
        id: "lane-1".to_string(),
        name: None,
        node_ids: vec!["left".to_string(), "right".to_string()],
        dormancy_timeout_seconds: dormancy_secs,
    });
    def
}

/// Config with short timings for paused-clock tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.abort_grace_secs = 2;
    config.engine.output_coalesce_ms = 100;
    config.stream.heartbeat_secs = 15;
    config
}
