//! Workflow definition snapshot.
//!
//! A `WorkflowDefinition` is the immutable description an execution is
//! started from: typed agent nodes, conditioned transitions between them,
//! human-in-the-loop gates, declared variables and parallel groups.

use serde::{Deserialize, Serialize};

/// Closed set of agent node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Planner,
    Coder,
    Reviewer,
    Tester,
    Documenter,
    Custom,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
            Self::Documenter => "documenter",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Value type of a variable or port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl VariableType {
    /// Whether a JSON value is acceptable for this type. `null` is always accepted.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match (self, value) {
            (_, Value::Null) | (Self::Any, _) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Object, Value::Object(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            _ => false,
        }
    }

    pub fn describe(value: &serde_json::Value) -> &'static str {
        use serde_json::Value;
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

/// Named, typed input or output of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSchema {
    pub name: String,
    #[serde(default, rename = "type")]
    pub port_type: VariableType,
    #[serde(default)]
    pub required: bool,
}

/// Per-node retry budget for failed runner attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// A unit of agent work in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub name: Option<String>,
    /// Runner configuration; string values may contain `{{ variable }}` placeholders.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub inputs: Vec<PortSchema>,
    #[serde(default)]
    pub outputs: Vec<PortSchema>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Upper bound for a single runner attempt.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl AgentNode {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            name: None,
            config: serde_json::Value::Null,
            inputs: vec![],
            outputs: vec![],
            description: None,
            retry: None,
            timeout_seconds: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<PortSchema>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Condition for following a transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionCondition {
    #[default]
    Always,
    OnSuccess,
    OnFailure,
    /// Boolean expression over variables, `output`, `gate` and `outcome`.
    Expression { expr: String },
}

/// A directed, conditioned edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: TransitionCondition,
    /// Marks a retry transition: a back edge that may be traversed at most this many times.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
}

impl Transition {
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, TransitionCondition::Always)
    }

    pub fn on_success(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, TransitionCondition::OnSuccess)
    }

    pub fn on_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, TransitionCondition::OnFailure)
    }

    pub fn expression(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::with_condition(from, to, TransitionCondition::Expression { expr: expr.into() })
    }

    fn with_condition(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: TransitionCondition,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition,
            retry: None,
        }
    }

    /// Turn this edge into a retry transition with the given budget.
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry = Some(budget);
        self
    }

    pub fn is_retry(&self) -> bool {
        self.retry.is_some()
    }
}

/// A selectable answer of a gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOption {
    pub value: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

impl GateOption {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: None,
            is_default: false,
        }
    }

    pub fn default_choice(value: impl Into<String>) -> Self {
        Self {
            is_default: true,
            ..Self::new(value)
        }
    }
}

/// Human-in-the-loop decision point attached to one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlGateDefinition {
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub options: Vec<GateOption>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl HitlGateDefinition {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>, options: Vec<GateOption>) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            title: None,
            options,
            timeout_seconds: None,
            required: true,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn has_option(&self, value: &str) -> bool {
        self.options.iter().any(|o| o.value == value)
    }

    pub fn default_option(&self) -> Option<&GateOption> {
        self.options.iter().find(|o| o.is_default)
    }
}

/// Declared execution variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDeclaration {
    pub name: String,
    #[serde(default, rename = "type")]
    pub var_type: VariableType,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl VariableDeclaration {
    pub fn new(name: impl Into<String>, var_type: VariableType) -> Self {
        Self {
            name: name.into(),
            var_type,
            default: None,
            required: false,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A named lane of nodes allowed to run concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub node_ids: Vec<String>,
    /// Fails a member whose runner stays silent for this long.
    #[serde(default)]
    pub dormancy_timeout_seconds: Option<u64>,
}

/// Immutable workflow snapshot bound to one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub nodes: Vec<AgentNode>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub gates: Vec<HitlGateDefinition>,
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
    #[serde(default)]
    pub parallel_groups: Vec<ParallelGroup>,
}

impl WorkflowDefinition {
    pub fn node(&self, id: &str) -> Option<&AgentNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn gate(&self, id: &str) -> Option<&HitlGateDefinition> {
        self.gates.iter().find(|g| g.id == id)
    }

    pub fn gate_for_node(&self, node_id: &str) -> Option<&HitlGateDefinition> {
        self.gates.iter().find(|g| g.node_id == node_id)
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDeclaration> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn group_of(&self, node_id: &str) -> Option<&ParallelGroup> {
        self.parallel_groups
            .iter()
            .find(|g| g.node_ids.iter().any(|n| n == node_id))
    }

    /// Outgoing transitions of a node in declaration order, with their indices.
    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = (usize, &Transition)> {
        let node_id = node_id.to_string();
        self.transitions
            .iter()
            .enumerate()
            .filter(move |(_, t)| t.from == node_id)
    }

    /// Nodes without incoming non-retry transitions.
    pub fn entry_nodes(&self) -> Vec<&AgentNode> {
        self.nodes
            .iter()
            .filter(|n| {
                !self
                    .transitions
                    .iter()
                    .any(|t| !t.is_retry() && t.to == n.id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_camel_case_definition() {
        let json = serde_json::json!({
            "id": "wf-1",
            "nodes": [
                { "id": "plan", "type": "planner", "config": { "prompt": "Plan {{ task }}" } },
                { "id": "code", "type": "coder", "retry": { "maxAttempts": 3 }, "timeoutSeconds": 600 }
            ],
            "transitions": [
                { "from": "plan", "to": "code", "condition": { "type": "on_success" } },
                { "from": "code", "to": "plan", "condition": { "type": "expression", "expr": "output.verdict == \"redo\"" }, "retry": 2 }
            ],
            "gates": [
                { "id": "g1", "nodeId": "plan", "options": [{ "value": "approve", "isDefault": true }, { "value": "reject" }], "timeoutSeconds": 30 }
            ],
            "variables": [{ "name": "task", "type": "string", "required": true }],
            "parallelGroups": [{ "id": "lane", "nodeIds": ["code"], "dormancyTimeoutSeconds": 60 }]
        });

        let def: WorkflowDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.nodes[0].node_type, NodeType::Planner);
        assert_eq!(def.nodes[1].retry.as_ref().unwrap().max_attempts, 3);
        assert_eq!(def.nodes[1].retry.as_ref().unwrap().initial_backoff_ms, 1_000);
        assert_eq!(def.transitions[0].condition, TransitionCondition::OnSuccess);
        assert!(def.transitions[1].is_retry());
        assert!(def.gates[0].required);
        assert_eq!(def.gates[0].default_option().unwrap().value, "approve");
        assert_eq!(def.variables[0].var_type, VariableType::String);
        assert_eq!(def.group_of("code").unwrap().dormancy_timeout_seconds, Some(60));
    }

    #[test]
    fn missing_condition_defaults_to_always() {
        let t: Transition = serde_json::from_str(r#"{"from":"a","to":"b"}"#).unwrap();
        assert_eq!(t.condition, TransitionCondition::Always);
        assert!(!t.is_retry());
    }

    #[test]
    fn entry_nodes_ignore_retry_edges() {
        let def = WorkflowDefinition {
            nodes: vec![
                AgentNode::new("a", NodeType::Planner),
                AgentNode::new("b", NodeType::Coder),
            ],
            transitions: vec![
                Transition::always("a", "b"),
                Transition::on_failure("b", "a").with_retry_budget(1),
            ],
            ..Default::default()
        };
        let entries: Vec<&str> = def.entry_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(entries, vec!["a"]);
    }

    #[test]
    fn variable_type_accepts() {
        assert!(VariableType::String.accepts(&serde_json::json!("x")));
        assert!(!VariableType::String.accepts(&serde_json::json!(1)));
        assert!(VariableType::Number.accepts(&serde_json::Value::Null));
        assert!(VariableType::Any.accepts(&serde_json::json!([1, 2])));
    }
}
