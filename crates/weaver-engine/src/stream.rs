//! Resumable per-execution event stream.
//!
//! A subscription is taken atomically with respect to event commits: the
//! backlog (events after the caller's cursor) and the live receiver are
//! captured under the same lock that appends events, so the stream neither
//! skips nor repeats an id. A receiver that falls behind the broadcast buffer
//! resynchronizes from the replay log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use weaver_core::event::{ConnectedSnapshot, ExecutionEvent, StreamFrame};

/// Source of retained events used to recover from a lagging receiver.
pub trait ReplaySource: Send + Sync + 'static {
    fn replay_after(&self, after: u64) -> BoxFuture<'_, Vec<ExecutionEvent>>;
}

/// Everything captured at connect time.
pub struct EventSubscription {
    pub connected: ConnectedSnapshot,
    pub backlog: Vec<ExecutionEvent>,
    pub receiver: broadcast::Receiver<ExecutionEvent>,
    /// Events with an id at or below this were already covered at connect time.
    pub cursor: u64,
}

struct StreamState {
    connected: Option<ConnectedSnapshot>,
    pending: VecDeque<ExecutionEvent>,
    receiver: broadcast::Receiver<ExecutionEvent>,
    last_id: u64,
    source: Arc<dyn ReplaySource>,
    heartbeat: Duration,
    finished: bool,
}

impl EventSubscription {
    /// Turn the subscription into a frame stream: `Connected`, then replayed and
    /// live events in id order, with `Heartbeat` after each idle `heartbeat`.
    /// The stream ends right after yielding `stream_end`.
    pub fn into_frames(
        self,
        source: Arc<dyn ReplaySource>,
        heartbeat: Duration,
    ) -> BoxStream<'static, StreamFrame> {
        let state = StreamState {
            connected: Some(self.connected),
            pending: self.backlog.into(),
            receiver: self.receiver,
            last_id: self.cursor,
            source,
            heartbeat,
            finished: false,
        };
        Box::pin(stream::unfold(state, next_frame))
    }
}

async fn next_frame(mut state: StreamState) -> Option<(StreamFrame, StreamState)> {
    if let Some(connected) = state.connected.take() {
        return Some((StreamFrame::Connected(connected), state));
    }

    loop {
        if state.finished {
            return None;
        }

        if let Some(event) = state.pending.pop_front() {
            if event.id <= state.last_id {
                continue;
            }
            state.last_id = event.id;
            state.finished = event.is_stream_end();
            return Some((StreamFrame::Event(event), state));
        }

        match tokio::time::timeout(state.heartbeat, state.receiver.recv()).await {
            Err(_) => return Some((StreamFrame::Heartbeat, state)),
            Ok(Ok(event)) => state.pending.push_back(event),
            Ok(Err(RecvError::Lagged(skipped))) => {
                debug!(skipped, last_id = state.last_id, "Stream receiver lagged, replaying");
                let missed = state.source.replay_after(state.last_id).await;
                state.pending.extend(missed);
            }
            Ok(Err(RecvError::Closed)) => {
                let missed = state.source.replay_after(state.last_id).await;
                if missed.is_empty() {
                    return None;
                }
                state.pending.extend(missed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;
    use weaver_core::event::EventKind;
    use weaver_core::types::ExecutionStatus;

    use crate::events::EventLog;

    struct SharedLog(Mutex<EventLog>);

    impl ReplaySource for SharedLog {
        fn replay_after(&self, after: u64) -> BoxFuture<'_, Vec<ExecutionEvent>> {
            Box::pin(async move { self.0.lock().await.since(after) })
        }
    }

    fn connected(last_event_id: u64) -> ConnectedSnapshot {
        ConnectedSnapshot {
            execution_id: "exec".into(),
            status: ExecutionStatus::Running,
            node_states: BTreeMap::new(),
            variables: BTreeMap::new(),
            started_at: Utc::now(),
            last_event_id,
            retry_ms: 3000,
        }
    }

    async fn subscribe(log: &Arc<SharedLog>, cursor: u64) -> BoxStream<'static, StreamFrame> {
        let guard = log.0.lock().await;
        let sub = EventSubscription {
            connected: connected(guard.last_id()),
            backlog: guard.since(cursor),
            receiver: guard.subscribe(),
            cursor,
        };
        drop(guard);
        sub.into_frames(log.clone(), Duration::from_secs(15))
    }

    fn event_id(frame: &StreamFrame) -> Option<u64> {
        match frame {
            StreamFrame::Event(e) => Some(e.id),
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replays_then_goes_live() {
        let log = Arc::new(SharedLog(Mutex::new(EventLog::new(None, 16))));
        for _ in 0..4 {
            log.0.lock().await.append(None, EventKind::ExecutionPaused);
        }

        let mut frames = subscribe(&log, 2).await;
        assert!(matches!(frames.next().await, Some(StreamFrame::Connected(c)) if c.last_event_id == 4));
        assert_eq!(event_id(&frames.next().await.unwrap()), Some(3));
        assert_eq!(event_id(&frames.next().await.unwrap()), Some(4));

        log.0.lock().await.append(None, EventKind::ExecutionResumed);
        assert_eq!(event_id(&frames.next().await.unwrap()), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_when_idle() {
        let log = Arc::new(SharedLog(Mutex::new(EventLog::new(None, 16))));
        let mut frames = subscribe(&log, 0).await;
        frames.next().await;
        assert!(matches!(frames.next().await, Some(StreamFrame::Heartbeat)));
    }

    #[tokio::test(start_paused = true)]
    async fn ends_after_stream_end() {
        let log = Arc::new(SharedLog(Mutex::new(EventLog::new(None, 16))));
        let mut frames = subscribe(&log, 0).await;
        {
            let mut guard = log.0.lock().await;
            guard.append(None, EventKind::ExecutionResumed);
            guard.append(
                None,
                EventKind::StreamEnd {
                    final_status: ExecutionStatus::Completed,
                },
            );
        }
        let rest: Vec<StreamFrame> = frames.by_ref().skip(1).collect().await;
        let ids: Vec<u64> = rest.iter().filter_map(event_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_receiver_resyncs_from_log() {
        let log = Arc::new(SharedLog(Mutex::new(EventLog::new(None, 2))));
        let mut frames = subscribe(&log, 0).await;
        frames.next().await;
        {
            let mut guard = log.0.lock().await;
            for _ in 0..6 {
                guard.append(None, EventKind::ExecutionPaused);
            }
        }
        let mut ids = Vec::new();
        while ids.len() < 6 {
            if let Some(id) = event_id(&frames.next().await.unwrap()) {
                ids.push(id);
            }
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }
}
