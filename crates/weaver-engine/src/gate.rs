use chrono::Utc;

use weaver_core::definition::HitlGateDefinition;
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::EventKind;
use weaver_core::types::{GateDecision, GateInstance, GateStatus};

/// Decider recorded when a timeout applies a gate's default option.
pub const SYSTEM_DECIDER: &str = "system";

/// Runtime table of gate instances for one execution.
///
/// Instances are created when their node's runner succeeds. Each open bumps a
/// generation counter so a timer armed for an earlier instance of the same gate
/// can tell it is stale.
#[derive(Debug, Default)]
pub struct GateController {
    instances: Vec<GateInstance>,
    generations: std::collections::HashMap<String, u64>,
}

impl GateController {
    /// Open (or reopen) a gate as pending. Returns the `gate_waiting` event and the timer generation.
    pub fn open(&mut self, def: &HitlGateDefinition) -> (EventKind, u64) {
        let instance = GateInstance {
            gate_id: def.id.clone(),
            node_id: def.node_id.clone(),
            status: GateStatus::Pending,
            required: def.required,
            options: def.options.iter().map(|o| o.value.clone()).collect(),
            timeout_seconds: def.timeout_seconds,
            opened_at: Utc::now(),
            decision: None,
        };
        let event = EventKind::GateWaiting {
            gate_id: instance.gate_id.clone(),
            options: instance.options.clone(),
            required: instance.required,
            timeout_seconds: instance.timeout_seconds,
        };

        match self.instances.iter_mut().find(|g| g.gate_id == def.id) {
            Some(existing) => *existing = instance,
            None => self.instances.push(instance),
        }
        let generation = self.generations.entry(def.id.clone()).or_insert(0);
        *generation += 1;
        (event, *generation)
    }

    pub fn get(&self, gate_id: &str) -> Option<&GateInstance> {
        self.instances.iter().find(|g| g.gate_id == gate_id)
    }

    pub fn instances(&self) -> &[GateInstance] {
        &self.instances
    }

    pub fn is_current(&self, gate_id: &str, generation: u64) -> bool {
        self.generations.get(gate_id) == Some(&generation)
            && self.get(gate_id).is_some_and(|g| g.status == GateStatus::Pending)
    }

    /// True while any required gate awaits a decision.
    pub fn has_blocking(&self) -> bool {
        self.instances
            .iter()
            .any(|g| g.required && g.status == GateStatus::Pending)
    }

    /// Check a decision without touching any state.
    ///
    /// `def` is the gate's definition in the execution's workflow, if any.
    pub fn check_decision(
        &self,
        def: Option<&HitlGateDefinition>,
        gate_id: &str,
        node_id: &str,
        option: &str,
    ) -> Result<()> {
        let def = def.ok_or_else(|| WeaverError::GateNotFound(gate_id.to_string()))?;
        if def.node_id != node_id {
            return Err(WeaverError::GateNotFound(format!("{} on node {}", gate_id, node_id)));
        }
        let instance = self
            .get(gate_id)
            .ok_or_else(|| WeaverError::GateNotFound(gate_id.to_string()))?;
        if instance.status != GateStatus::Pending {
            return Err(WeaverError::GateNotPending {
                gate_id: gate_id.to_string(),
                status: instance.status,
            });
        }
        if !def.has_option(option) {
            return Err(WeaverError::InvalidGateOption {
                gate_id: gate_id.to_string(),
                option: option.to_string(),
            });
        }
        Ok(())
    }

    /// Record a decision on a pending gate. Callers validate with `check_decision` first.
    pub fn decide(
        &mut self,
        gate_id: &str,
        option: &str,
        decided_by: &str,
        reason: Option<String>,
        auto_resolved: bool,
    ) -> Option<(GateDecision, EventKind)> {
        let instance = self
            .instances
            .iter_mut()
            .find(|g| g.gate_id == gate_id && g.status == GateStatus::Pending)?;
        let decision = GateDecision {
            selected_option: option.to_string(),
            decided_by: decided_by.to_string(),
            reason,
            decided_at: Utc::now(),
            auto_resolved,
        };
        instance.status = GateStatus::Decided;
        instance.decision = Some(decision.clone());
        let event = EventKind::GateDecided {
            gate_id: gate_id.to_string(),
            selected_option: decision.selected_option.clone(),
            decided_by: decision.decided_by.clone(),
            reason: decision.reason.clone(),
            auto_resolved,
        };
        Some((decision, event))
    }

    /// Mark a pending gate expired. Returns whether it was pending.
    pub fn expire(&mut self, gate_id: &str) -> bool {
        self.set_status_if_pending(gate_id, GateStatus::Expired)
    }

    /// Skip every pending gate (optionally only non-required ones). Returns the ids skipped.
    pub fn skip_pending(&mut self, only_optional: bool) -> Vec<String> {
        self.instances
            .iter_mut()
            .filter(|g| g.status == GateStatus::Pending && !(only_optional && g.required))
            .map(|g| {
                g.status = GateStatus::Skipped;
                g.gate_id.clone()
            })
            .collect()
    }

    fn set_status_if_pending(&mut self, gate_id: &str, status: GateStatus) -> bool {
        match self
            .instances
            .iter_mut()
            .find(|g| g.gate_id == gate_id && g.status == GateStatus::Pending)
        {
            Some(g) => {
                g.status = status;
                true
            }
            None => false,
        }
    }
}
