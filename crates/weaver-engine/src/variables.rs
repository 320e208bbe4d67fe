use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use weaver_core::definition::{VariableType, WorkflowDefinition};
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::EventKind;

/// Live variable bindings of one execution.
///
/// The store is owned by the execution's control state, so every write goes
/// through the single serialized path that holds that lock. Reads hand out an
/// `Arc` of the current map: a snapshot never observes a later write, and
/// writers copy the map only while a snapshot is still held elsewhere.
#[derive(Debug, Clone)]
pub struct VariableStore {
    types: HashMap<String, VariableType>,
    values: Arc<BTreeMap<String, Value>>,
}

impl VariableStore {
    /// Seed from declarations: defaults first, then supplied values on top.
    ///
    /// Fails when a required variable ends up without a value or a supplied
    /// value does not match its declared type. Undeclared initial values are
    /// kept as untyped bindings.
    pub fn seed(definition: &WorkflowDefinition, initial: BTreeMap<String, Value>) -> Result<Self> {
        let mut values = BTreeMap::new();
        let mut types = HashMap::new();

        for decl in &definition.variables {
            types.insert(decl.name.clone(), decl.var_type);
            if let Some(default) = &decl.default {
                values.insert(decl.name.clone(), default.clone());
            }
        }

        for (name, value) in initial {
            check_type(&types, &name, &value)?;
            values.insert(name, value);
        }

        for decl in &definition.variables {
            let missing = values.get(&decl.name).map_or(true, Value::is_null);
            if decl.required && missing {
                return Err(WeaverError::MissingVariable(decl.name.clone()));
            }
        }

        Ok(Self {
            types,
            values: Arc::new(values),
        })
    }

    pub fn snapshot(&self) -> Arc<BTreeMap<String, Value>> {
        Arc::clone(&self.values)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Bind `name` to `value` and describe the change as a `variable_updated` event.
    pub fn set(
        &mut self,
        name: &str,
        value: Value,
        source_node_id: Option<&str>,
    ) -> Result<EventKind> {
        check_type(&self.types, name, &value)?;
        let previous = Arc::make_mut(&mut self.values).insert(name.to_string(), value.clone());
        Ok(EventKind::VariableUpdated {
            name: name.to_string(),
            value,
            previous,
            source_node_id: source_node_id.map(str::to_string),
        })
    }
}

fn check_type(types: &HashMap<String, VariableType>, name: &str, value: &Value) -> Result<()> {
    match types.get(name) {
        Some(expected) if !expected.accepts(value) => Err(WeaverError::VariableType {
            name: name.to_string(),
            expected: expected.to_string(),
            actual: VariableType::describe(value).to_string(),
        }),
        _ => Ok(()),
    }
}
