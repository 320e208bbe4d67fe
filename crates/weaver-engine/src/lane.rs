use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use weaver_core::definition::WorkflowDefinition;

/// A node's slot inside its lane: the lane id, a cancellation token scoped to
/// this node run, and the lane's dormancy limit.
#[derive(Debug, Clone)]
pub struct LaneSlot {
    pub lane_id: String,
    pub cancel: CancellationToken,
    pub dormancy: Option<Duration>,
}

struct LaneEntry {
    cancel: CancellationToken,
    dormancy: Option<Duration>,
    active: usize,
}

/// Active lanes of an execution.
///
/// A parallel group is one lane shared by its members; any other node runs
/// in a lane of its own, named after the node. Cancellation nests
/// execution → lane → node, so aborting the execution reaches every node while
/// a dormant node can be cancelled alone.
pub struct LaneTable {
    root: CancellationToken,
    lanes: BTreeMap<String, LaneEntry>,
}

impl LaneTable {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            lanes: BTreeMap::new(),
        }
    }

    /// Enter the lane of `node_id`, creating it if no member is active.
    pub fn enter(&mut self, definition: &WorkflowDefinition, node_id: &str) -> LaneSlot {
        let (lane_id, dormancy) = match definition.group_of(node_id) {
            Some(group) => (
                group.id.clone(),
                group.dormancy_timeout_seconds.map(Duration::from_secs),
            ),
            None => (node_id.to_string(), None),
        };
        let root = &self.root;
        let entry = self.lanes.entry(lane_id.clone()).or_insert_with(|| LaneEntry {
            cancel: root.child_token(),
            dormancy,
            active: 0,
        });
        entry.active += 1;
        LaneSlot {
            lane_id,
            cancel: entry.cancel.child_token(),
            dormancy: entry.dormancy,
        }
    }

    /// Leave a lane; the lane is dropped once its last member leaves.
    pub fn leave(&mut self, lane_id: &str) {
        if let Some(entry) = self.lanes.get_mut(lane_id) {
            entry.active = entry.active.saturating_sub(1);
            if entry.active == 0 {
                self.lanes.remove(lane_id);
            }
        }
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.lanes.keys().cloned().collect()
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}
