use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::parser::number_value;
use super::ExprError;

/// Read-only name lookup for evaluation: local bindings shadow variables.
pub struct Scope<'a> {
    variables: &'a BTreeMap<String, Value>,
    locals: BTreeMap<&'static str, Value>,
}

impl<'a> Scope<'a> {
    pub fn new(variables: &'a BTreeMap<String, Value>) -> Self {
        Self {
            variables,
            locals: BTreeMap::new(),
        }
    }

    pub fn bind(mut self, name: &'static str, value: Value) -> Self {
        self.locals.insert(name, value);
        self
    }

    fn lookup(&self, name: &str) -> Value {
        self.locals
            .get(name)
            .or_else(|| self.variables.get(name))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Evaluate to a JSON value.
pub fn evaluate(expr: &Expr, scope: &Scope<'_>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => Ok(scope.lookup(name)),
        Expr::Member(target, field) => {
            let target = evaluate(target, scope)?;
            Ok(member(&target, field))
        }
        Expr::Index(target, index) => {
            let target = evaluate(target, scope)?;
            let index = evaluate(index, scope)?;
            index_value(&target, &index)
        }
        Expr::Unary(UnaryOp::Not, operand) => {
            let value = evaluate(operand, scope)?;
            Ok(Value::Bool(!truthy(&value)?))
        }
        Expr::Unary(UnaryOp::Neg, operand) => {
            let value = evaluate(operand, scope)?;
            Ok(number_value(-as_number(&value, "-")?))
        }
        Expr::Binary(BinaryOp::And, left, right) => {
            if !truthy(&evaluate(left, scope)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&evaluate(right, scope)?)?))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if truthy(&evaluate(left, scope)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&evaluate(right, scope)?)?))
        }
        Expr::Binary(op, left, right) => {
            let left = evaluate(left, scope)?;
            let right = evaluate(right, scope)?;
            binary(*op, &left, &right)
        }
    }
}

/// Evaluate and require a boolean result. `null` counts as false.
pub fn evaluate_bool(expr: &Expr, scope: &Scope<'_>) -> Result<bool, ExprError> {
    let value = evaluate(expr, scope)?;
    match value {
        Value::Bool(b) => Ok(b),
        Value::Null => Ok(false),
        other => Err(ExprError::NotBoolean(type_name(&other))),
    }
}

fn member(target: &Value, field: &str) -> Value {
    match target {
        Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
        Value::Array(items) if field == "length" => Value::from(items.len()),
        Value::String(s) if field == "length" => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, ExprError> {
    match (target, index) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::Array(items), Value::Number(n)) => {
            let i = n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .ok_or_else(|| ExprError::Type(format!("invalid array index {}", n)))?;
            Ok(items.get(i as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (t, i) => Err(ExprError::Type(format!(
            "cannot index {} with {}",
            type_name(t),
            type_name(i)
        ))),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(left, right)?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            _ => Ok(number_value(as_number(left, "+")? + as_number(right, "+")?)),
        },
        BinaryOp::Sub => Ok(number_value(as_number(left, "-")? - as_number(right, "-")?)),
        BinaryOp::Mul => Ok(number_value(as_number(left, "*")? * as_number(right, "*")?)),
        BinaryOp::Div | BinaryOp::Rem => {
            let a = as_number(left, "/")?;
            let b = as_number(right, "/")?;
            if b == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            Ok(number_value(if op == BinaryOp::Div { a / b } else { a % b }))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators handled in evaluate"),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, ExprError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| ExprError::Type("cannot compare NaN".to_string()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (a, b) => Err(ExprError::Type(format!(
            "cannot compare {} with {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

fn truthy(value: &Value) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(ExprError::Type(format!(
            "expected boolean, got {}",
            type_name(other)
        ))),
    }
}

fn as_number(value: &Value, op: &str) -> Result<f64, ExprError> {
    value.as_f64().ok_or_else(|| {
        ExprError::Type(format!("operator '{}' needs numbers, got {}", op, type_name(value)))
    })
}

fn type_name(value: &Value) -> &'static str {
    weaver_core::definition::VariableType::describe(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;
    use serde_json::json;

    fn eval(src: &str, vars: &BTreeMap<String, Value>) -> Result<Value, ExprError> {
        let scope = Scope::new(vars).bind("output", json!({ "score": 0.82, "files": ["a.rs", "b.rs"], "verdict": "approve" }));
        evaluate(&parse(src).unwrap(), &scope)
    }

    fn vars() -> BTreeMap<String, Value> {
        let mut v = BTreeMap::new();
        v.insert("threshold".to_string(), json!(0.8));
        v.insert("attempts".to_string(), json!(3));
        v.insert("branch".to_string(), json!("main"));
        v
    }

    #[test]
    fn arithmetic() {
        let v = vars();
        assert_eq!(eval("attempts * 2 + 1", &v).unwrap(), json!(7));
        assert_eq!(eval("attempts % 2", &v).unwrap(), json!(1));
        assert_eq!(eval("-attempts", &v).unwrap(), json!(-3));
        assert_eq!(eval("branch + '-hotfix'", &v).unwrap(), json!("main-hotfix"));
        assert!(matches!(eval("attempts / 0", &v), Err(ExprError::DivisionByZero)));
    }

    #[test]
    fn comparisons_and_booleans() {
        let v = vars();
        assert_eq!(eval("output.score >= threshold", &v).unwrap(), json!(true));
        assert_eq!(eval("attempts == 3.0", &v).unwrap(), json!(true));
        assert_eq!(
            eval("output.verdict == 'approve' && branch != 'release'", &v).unwrap(),
            json!(true)
        );
        assert_eq!(eval("not (attempts > 5) or missing", &v).unwrap(), json!(true));
    }

    #[test]
    fn member_and_index() {
        let v = vars();
        assert_eq!(eval("output.files[1]", &v).unwrap(), json!("b.rs"));
        assert_eq!(eval("output.files.length", &v).unwrap(), json!(2));
        assert_eq!(eval("output['verdict']", &v).unwrap(), json!("approve"));
        assert_eq!(eval("output.nothing.deeper", &v).unwrap(), Value::Null);
        assert_eq!(eval("output.files[7]", &v).unwrap(), Value::Null);
    }

    #[test]
    fn short_circuit_skips_type_errors() {
        let v = vars();
        assert_eq!(eval("false && (branch > 1)", &v).unwrap(), json!(false));
        assert!(eval("true && (branch > 1)", &v).is_err());
    }

    #[test]
    fn bool_result_required() {
        let v = vars();
        let scope = Scope::new(&v);
        assert!(evaluate_bool(&parse("attempts == 3").unwrap(), &scope).unwrap());
        assert!(!evaluate_bool(&parse("unset").unwrap(), &scope).unwrap());
        assert!(matches!(
            evaluate_bool(&parse("attempts").unwrap(), &scope),
            Err(ExprError::NotBoolean("number"))
        ));
    }

    #[test]
    fn locals_shadow_variables() {
        let mut v = vars();
        v.insert("outcome".to_string(), json!("shadowed"));
        let scope = Scope::new(&v).bind("outcome", json!("success"));
        assert!(evaluate_bool(&parse("outcome == 'success'").unwrap(), &scope).unwrap());
    }
}
