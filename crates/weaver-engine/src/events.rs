use std::collections::VecDeque;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use weaver_core::event::{EventKind, ExecutionEvent};

/// Append-only, sequenced event log of one execution with live fan-out.
///
/// Ids start at 1 and grow by exactly one per append. The log is mutated only
/// under the execution's control lock, so append order equals commit order and
/// a subscriber registered under the same lock sees every later event exactly
/// once on its receiver.
pub struct EventLog {
    events: VecDeque<ExecutionEvent>,
    next_id: u64,
    capacity: Option<usize>,
    sender: broadcast::Sender<ExecutionEvent>,
    end_id: Option<u64>,
}

impl EventLog {
    /// `capacity` bounds the replay log as a ring buffer; `None` retains everything.
    pub fn new(capacity: Option<usize>, broadcast_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            events: VecDeque::new(),
            next_id: 1,
            capacity: capacity.filter(|c| *c > 0),
            sender,
            end_id: None,
        }
    }

    /// Sequence, store and broadcast an event. Returns `None` once the stream has ended.
    pub fn append(&mut self, node_id: Option<&str>, kind: EventKind) -> Option<ExecutionEvent> {
        if self.end_id.is_some() {
            debug!(event = kind.type_tag(), "Dropping event after stream end");
            return None;
        }
        let event = ExecutionEvent {
            id: self.next_id,
            timestamp: Utc::now(),
            node_id: node_id.map(str::to_string),
            kind,
        };
        self.next_id += 1;
        if event.is_stream_end() {
            self.end_id = Some(event.id);
        }

        if let Some(capacity) = self.capacity {
            while self.events.len() >= capacity {
                self.events.pop_front();
            }
        }
        self.events.push_back(event.clone());
        // No receivers is fine; the replay log still has it
        let _ = self.sender.send(event.clone());
        Some(event)
    }

    /// Highest id assigned so far (0 before the first event).
    pub fn last_id(&self) -> u64 {
        self.next_id - 1
    }

    /// Id of the `stream_end` event, once emitted.
    pub fn end_id(&self) -> Option<u64> {
        self.end_id
    }

    pub fn is_closed(&self) -> bool {
        self.end_id.is_some()
    }

    /// Retained events with an id greater than `after`, in order.
    pub fn since(&self, after: u64) -> Vec<ExecutionEvent> {
        let start = self.events.partition_point(|e| e.id <= after);
        self.events.range(start..).cloned().collect()
    }

    pub fn all(&self) -> Vec<ExecutionEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}
