//! Structural validation of workflow definitions.
//!
//! `validate` either rejects a definition with the full list of problems it
//! found, or returns a `CompiledWorkflow`: the definition plus the parsed form
//! of every expression condition, ready to be bound to an execution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use weaver_core::definition::{TransitionCondition, WorkflowDefinition};
use weaver_core::error::{Result, WeaverError};

use crate::expr::{self, Expr, BUILTIN_NAMES};

/// A definition that passed validation, with its conditions pre-parsed.
#[derive(Debug)]
pub struct CompiledWorkflow {
    definition: WorkflowDefinition,
    conditions: HashMap<usize, Expr>,
    incoming: HashMap<String, Vec<usize>>,
}

impl CompiledWorkflow {
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Parsed expression of the transition at `index`, if it has one.
    pub fn condition(&self, index: usize) -> Option<&Expr> {
        self.conditions.get(&index)
    }

    /// Indices of non-retry transitions pointing at `node_id`.
    pub fn incoming(&self, node_id: &str) -> &[usize] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes reachable from `start` (inclusive) over non-retry transitions.
    pub fn forward_closure(&self, start: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id.to_string());
            for (_, t) in self.definition.outgoing(id) {
                if !t.is_retry() {
                    queue.push_back(t.to.as_str());
                }
            }
        }
        order
    }
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// Check a definition for structural soundness and compile its conditions.
pub fn validate(definition: &WorkflowDefinition) -> Result<CompiledWorkflow> {
    let mut issues = Vec::new();

    if definition.nodes.is_empty() {
        issues.push("workflow has no nodes".to_string());
    }

    let mut node_ids = HashSet::new();
    for node in &definition.nodes {
        if node.id.trim().is_empty() {
            issues.push("node with empty id".to_string());
        } else if !node_ids.insert(node.id.as_str()) {
            issues.push(format!("duplicate node id '{}'", node.id));
        }
        if let Some(retry) = &node.retry {
            if retry.max_attempts == 0 {
                issues.push(format!("node '{}': retry.maxAttempts must be at least 1", node.id));
            }
        }
        if node.timeout_seconds == Some(0) {
            issues.push(format!("node '{}': timeoutSeconds must be positive", node.id));
        }
    }

    let mut declared: HashSet<&str> = HashSet::new();
    for var in &definition.variables {
        if !identifier_re().is_match(&var.name) {
            issues.push(format!("variable name '{}' is not an identifier", var.name));
        } else if BUILTIN_NAMES.contains(&var.name.as_str()) {
            issues.push(format!("variable name '{}' is reserved", var.name));
        } else if !declared.insert(var.name.as_str()) {
            issues.push(format!("duplicate variable '{}'", var.name));
        }
        if let Some(default) = &var.default {
            if !var.var_type.accepts(default) {
                issues.push(format!(
                    "variable '{}': default is {}, declared {}",
                    var.name,
                    weaver_core::definition::VariableType::describe(default),
                    var.var_type
                ));
            }
        }
    }

    let mut conditions = HashMap::new();
    for (index, t) in definition.transitions.iter().enumerate() {
        for endpoint in [&t.from, &t.to] {
            if !node_ids.contains(endpoint.as_str()) {
                issues.push(format!(
                    "transition #{} ({} -> {}) references unknown node '{}'",
                    index, t.from, t.to, endpoint
                ));
            }
        }
        if t.retry == Some(0) {
            issues.push(format!(
                "transition #{} ({} -> {}): retry budget must be at least 1",
                index, t.from, t.to
            ));
        }
        if let TransitionCondition::Expression { expr: source } = &t.condition {
            match expr::parse(source) {
                Ok(parsed) => {
                    for root in parsed.root_identifiers() {
                        if !declared.contains(root) && !BUILTIN_NAMES.contains(&root) {
                            issues.push(format!(
                                "transition #{} ({} -> {}): undefined variable '{}' in condition",
                                index, t.from, t.to, root
                            ));
                        }
                    }
                    conditions.insert(index, parsed);
                }
                Err(e) => issues.push(format!(
                    "transition #{} ({} -> {}): {}",
                    index, t.from, t.to, e
                )),
            }
        }
    }

    let mut gate_ids = HashSet::new();
    let mut gated_nodes = HashSet::new();
    for gate in &definition.gates {
        if !gate_ids.insert(gate.id.as_str()) {
            issues.push(format!("duplicate gate id '{}'", gate.id));
        }
        if !node_ids.contains(gate.node_id.as_str()) {
            issues.push(format!("gate '{}' references unknown node '{}'", gate.id, gate.node_id));
        } else if !gated_nodes.insert(gate.node_id.as_str()) {
            issues.push(format!("node '{}' carries more than one gate", gate.node_id));
        }
        if gate.options.is_empty() {
            issues.push(format!("gate '{}' declares no options", gate.id));
        }
        let mut values = HashSet::new();
        for option in &gate.options {
            if !values.insert(option.value.as_str()) {
                issues.push(format!("gate '{}': duplicate option '{}'", gate.id, option.value));
            }
        }
        if gate.options.iter().filter(|o| o.is_default).count() > 1 {
            issues.push(format!("gate '{}' marks more than one default option", gate.id));
        }
        if gate.timeout_seconds == Some(0) {
            issues.push(format!("gate '{}': timeoutSeconds must be positive", gate.id));
        }
    }

    let mut group_ids = HashSet::new();
    let mut grouped: HashMap<&str, &str> = HashMap::new();
    for group in &definition.parallel_groups {
        if !group_ids.insert(group.id.as_str()) {
            issues.push(format!("duplicate parallel group id '{}'", group.id));
        }
        if group.node_ids.is_empty() {
            issues.push(format!("parallel group '{}' is empty", group.id));
        }
        for node_id in &group.node_ids {
            if !node_ids.contains(node_id.as_str()) {
                issues.push(format!(
                    "parallel group '{}' references unknown node '{}'",
                    group.id, node_id
                ));
            } else if let Some(other) = grouped.insert(node_id.as_str(), group.id.as_str()) {
                if other != group.id {
                    issues.push(format!(
                        "node '{}' belongs to parallel groups '{}' and '{}'",
                        node_id, other, group.id
                    ));
                }
            }
        }
    }

    if issues.is_empty() {
        if let Some(cycle_nodes) = find_cycle(definition) {
            issues.push(format!(
                "cycle through nodes [{}] is not bounded by a retry transition",
                cycle_nodes.join(", ")
            ));
        }
    }

    if !issues.is_empty() {
        debug!(workflow_id = %definition.id, issues = issues.len(), "Workflow rejected");
        return Err(WeaverError::InvalidWorkflow(issues));
    }

    let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, t) in definition.transitions.iter().enumerate() {
        if !t.is_retry() {
            incoming.entry(t.to.clone()).or_default().push(index);
        }
    }

    Ok(CompiledWorkflow {
        definition: definition.clone(),
        conditions,
        incoming,
    })
}

/// Kahn's algorithm over non-retry transitions. Returns the nodes left on a cycle, if any.
fn find_cycle(definition: &WorkflowDefinition) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> =
        definition.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for t in definition.transitions.iter().filter(|t| !t.is_retry()) {
        *in_degree.entry(t.to.as_str()).or_default() += 1;
    }

    let mut queue: VecDeque<&str> = definition
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut visited = 0;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for t in definition.transitions.iter().filter(|t| !t.is_retry() && t.from == id) {
            if let Some(d) = in_degree.get_mut(t.to.as_str()) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(t.to.as_str());
                }
            }
        }
    }

    if visited == definition.nodes.len() {
        return None;
    }
    let mut remaining: Vec<String> = in_degree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(id, _)| id.to_string())
        .collect();
    remaining.sort();
    Some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weaver_core::definition::*;

    fn issues(def: &WorkflowDefinition) -> Vec<String> {
        match validate(def) {
            Err(WeaverError::InvalidWorkflow(issues)) => issues,
            other => panic!("expected validation failure, got {:?}", other.map(|_| ())),
        }
    }

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".into(),
            nodes: vec![
                AgentNode::new("plan", NodeType::Planner),
                AgentNode::new("code", NodeType::Coder),
                AgentNode::new("review", NodeType::Reviewer),
            ],
            transitions: vec![
                Transition::on_success("plan", "code"),
                Transition::expression("code", "review", "output.files.length > 0 && strict"),
            ],
            variables: vec![VariableDeclaration::new("strict", VariableType::Boolean)
                .with_default(json!(true))],
            ..Default::default()
        }
    }

    #[test]
    fn accepts_linear_workflow() {
        let compiled = validate(&linear()).unwrap();
        assert!(compiled.condition(1).is_some());
        assert!(compiled.condition(0).is_none());
        assert_eq!(compiled.incoming("review"), &[1]);
        assert_eq!(compiled.forward_closure("code"), vec!["code", "review"]);
    }

    #[test]
    fn rejects_duplicate_and_dangling_ids() {
        let mut def = linear();
        def.nodes.push(AgentNode::new("plan", NodeType::Custom));
        def.transitions.push(Transition::always("review", "ghost"));
        let found = issues(&def);
        assert!(found.iter().any(|i| i.contains("duplicate node id 'plan'")));
        assert!(found.iter().any(|i| i.contains("unknown node 'ghost'")));
    }

    #[test]
    fn rejects_unbounded_cycle() {
        let mut def = linear();
        def.transitions.push(Transition::on_failure("review", "code"));
        let found = issues(&def);
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("code, review"), "{}", found[0]);
    }

    #[test]
    fn retry_transition_may_loop_back() {
        let mut def = linear();
        def.transitions
            .push(Transition::expression("review", "code", "output.verdict == 'redo'").with_retry_budget(2));
        assert!(validate(&def).is_ok());

        def.transitions.last_mut().unwrap().retry = Some(0);
        assert!(issues(&def)[0].contains("retry budget"));
    }

    #[test]
    fn rejects_bad_expressions() {
        let mut def = linear();
        def.transitions.push(Transition::expression("plan", "review", "unknown_var > 1"));
        def.transitions.push(Transition::expression("plan", "review", "1 +"));
        let found = issues(&def);
        assert!(found.iter().any(|i| i.contains("undefined variable 'unknown_var'")));
        assert!(found.iter().any(|i| i.contains("transition #3")));
    }

    #[test]
    fn oversized_and_deeply_nested_expressions_are_rejected() {
        let mut def = linear();
        let long = format!("{}true", "!".repeat(200_000));
        let deep = format!("{}true{}", "(".repeat(500), ")".repeat(500));
        def.transitions.push(Transition::expression("plan", "review", long));
        def.transitions.push(Transition::expression("plan", "review", deep));
        let found = issues(&def);
        assert!(found.iter().any(|i| i.contains("transition #2") && i.contains("limit is 1024")));
        assert!(found.iter().any(|i| i.contains("transition #3") && i.contains("nests deeper than 64")));
    }

    #[test]
    fn rejects_gate_problems() {
        let mut def = linear();
        def.gates = vec![
            HitlGateDefinition::new(
                "g1",
                "review",
                vec![GateOption::default_choice("approve"), GateOption::default_choice("reject")],
            ),
            HitlGateDefinition::new("g2", "review", vec![GateOption::new("x"), GateOption::new("x")]),
            HitlGateDefinition::new("g3", "nowhere", vec![]),
        ];
        let found = issues(&def);
        assert!(found.iter().any(|i| i.contains("more than one default")));
        assert!(found.iter().any(|i| i.contains("more than one gate")));
        assert!(found.iter().any(|i| i.contains("duplicate option 'x'")));
        assert!(found.iter().any(|i| i.contains("unknown node 'nowhere'")));
        assert!(found.iter().any(|i| i.contains("declares no options")));
    }

    #[test]
    fn node_in_two_groups() {
        let mut def = linear();
        def.parallel_groups = vec![
            ParallelGroup {
                id: "a".into(),
                name: None,
                node_ids: vec!["code".into()],
                dormancy_timeout_seconds: None,
            },
            ParallelGroup {
                id: "b".into(),
                name: None,
                node_ids: vec!["code".into(), "review".into()],
                dormancy_timeout_seconds: Some(30),
            },
        ];
        let found = issues(&def);
        assert_eq!(found, vec!["node 'code' belongs to parallel groups 'a' and 'b'"]);
    }

    #[test]
    fn reserved_and_mistyped_variables() {
        let mut def = linear();
        def.variables.push(VariableDeclaration::new("output", VariableType::Any));
        def.variables
            .push(VariableDeclaration::new("count", VariableType::Number).with_default(json!("three")));
        let found = issues(&def);
        assert!(found.iter().any(|i| i.contains("'output' is reserved")));
        assert!(found.iter().any(|i| i.contains("default is string, declared number")));
    }
}
