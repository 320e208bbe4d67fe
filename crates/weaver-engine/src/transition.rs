use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use weaver_core::definition::TransitionCondition;
use weaver_core::types::GateDecision;

use crate::expr::{evaluate_bool, Scope};
use crate::validator::CompiledWorkflow;

/// Terminal result of a node run, as seen by its outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Inputs available to the conditions of one finished node.
pub struct RouteContext<'a> {
    pub variables: &'a BTreeMap<String, Value>,
    pub output: Option<&'a Value>,
    pub gate: Option<&'a GateDecision>,
    pub outcome: Outcome,
}

/// A transition whose condition matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub index: usize,
    pub to: String,
    pub retry: bool,
}

/// Evaluate the outgoing transitions of `node_id` in declaration order.
///
/// Every matching transition fires. A condition that cannot be evaluated
/// (type error, non-boolean result) does not match.
pub fn route(workflow: &CompiledWorkflow, node_id: &str, ctx: &RouteContext<'_>) -> Vec<Fired> {
    workflow
        .definition()
        .outgoing(node_id)
        .filter(|(index, t)| matches(workflow, *index, &t.condition, node_id, ctx))
        .map(|(index, t)| Fired {
            index,
            to: t.to.clone(),
            retry: t.is_retry(),
        })
        .collect()
}

fn matches(
    workflow: &CompiledWorkflow,
    index: usize,
    condition: &TransitionCondition,
    node_id: &str,
    ctx: &RouteContext<'_>,
) -> bool {
    match condition {
        TransitionCondition::Always => true,
        TransitionCondition::OnSuccess => ctx.outcome == Outcome::Success,
        TransitionCondition::OnFailure => ctx.outcome == Outcome::Failure,
        TransitionCondition::Expression { expr: source } => {
            let Some(expr) = workflow.condition(index) else {
                warn!(node_id, transition = index, "Expression transition was not compiled");
                return false;
            };
            let gate = ctx.gate.map_or(Value::Null, |d| {
                serde_json::json!({
                    "selectedOption": d.selected_option,
                    "decidedBy": d.decided_by,
                    "reason": d.reason,
                    "autoResolved": d.auto_resolved,
                })
            });
            let scope = Scope::new(ctx.variables)
                .bind("output", ctx.output.cloned().unwrap_or(Value::Null))
                .bind("gate", gate)
                .bind("outcome", Value::String(ctx.outcome.as_str().to_string()));
            match evaluate_bool(expr, &scope) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!(node_id, transition = index, expr = %source, error = %e, "Condition did not evaluate");
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use weaver_core::definition::*;

    use crate::validator::validate;

    fn workflow() -> CompiledWorkflow {
        validate(&WorkflowDefinition {
            nodes: vec![
                AgentNode::new("a", NodeType::Coder),
                AgentNode::new("b", NodeType::Tester),
                AgentNode::new("c", NodeType::Documenter),
                AgentNode::new("d", NodeType::Reviewer),
                AgentNode::new("e", NodeType::Custom),
            ],
            transitions: vec![
                Transition::always("a", "b"),
                Transition::on_failure("a", "c"),
                Transition::expression("a", "d", "output.coverage >= min_coverage"),
                Transition::expression("a", "e", "gate.selectedOption == 'ship'"),
                Transition::expression("a", "e", "output.coverage"),
            ],
            variables: vec![VariableDeclaration::new("min_coverage", VariableType::Number)],
            ..Default::default()
        })
        .unwrap()
    }

    fn vars() -> BTreeMap<String, Value> {
        BTreeMap::from([("min_coverage".to_string(), json!(80))])
    }

    #[test]
    fn success_fans_out_in_declaration_order() {
        let wf = workflow();
        let vars = vars();
        let output = json!({ "coverage": 91 });
        let fired = route(
            &wf,
            "a",
            &RouteContext {
                variables: &vars,
                output: Some(&output),
                gate: None,
                outcome: Outcome::Success,
            },
        );
        let targets: Vec<&str> = fired.iter().map(|f| f.to.as_str()).collect();
        assert_eq!(targets, vec!["b", "d"]);
        assert_eq!(fired[1].index, 2);
    }

    #[test]
    fn failure_takes_always_and_on_failure() {
        let wf = workflow();
        let vars = vars();
        let fired = route(
            &wf,
            "a",
            &RouteContext {
                variables: &vars,
                output: None,
                gate: None,
                outcome: Outcome::Failure,
            },
        );
        let targets: Vec<&str> = fired.iter().map(|f| f.to.as_str()).collect();
        assert_eq!(targets, vec!["b", "c"]);
    }

    #[test]
    fn gate_selection_is_in_scope() {
        let wf = workflow();
        let vars = vars();
        let decision = GateDecision {
            selected_option: "ship".into(),
            decided_by: "alice".into(),
            reason: None,
            decided_at: Utc::now(),
            auto_resolved: false,
        };
        let output = json!({ "coverage": 10 });
        let fired = route(
            &wf,
            "a",
            &RouteContext {
                variables: &vars,
                output: Some(&output),
                gate: Some(&decision),
                outcome: Outcome::Success,
            },
        );
        assert!(fired.iter().any(|f| f.to == "e" && f.index == 3));
        // `output.coverage` is a number, not a boolean: no match
        assert!(!fired.iter().any(|f| f.index == 4));
    }
}
