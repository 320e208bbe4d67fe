use std::convert::Infallible;

use axum::response::sse::Event;
use serde::Deserialize;

use weaver_core::event::StreamFrame;

/// Body of `POST /api/executions/{id}/abort`.
#[derive(Debug, Default, Deserialize)]
pub struct AbortBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of `POST /api/executions/{id}/gates/{gateId}/decision`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionBody {
    pub node_id: String,
    pub selected_option: String,
    /// Defaults to the authenticated principal.
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Query of `GET /api/executions/{id}/events`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    #[serde(default)]
    pub last_event_id: Option<u64>,
}

/// Render one stream frame as an SSE event.
///
/// Domain events carry their sequence number as the SSE id so a reconnecting
/// client sends it back in `Last-Event-ID`. Heartbeats are comments.
pub fn sse_event(frame: StreamFrame) -> Result<Event, Infallible> {
    let event = match frame {
        StreamFrame::Connected(snapshot) => {
            let retry = std::time::Duration::from_millis(snapshot.retry_ms);
            Event::default()
                .event("connected")
                .retry(retry)
                .data(serde_json::to_string(&snapshot).unwrap_or_default())
        }
        StreamFrame::Event(event) => Event::default()
            .id(event.id.to_string())
            .event(event.event_type())
            .data(serde_json::to_string(&event).unwrap_or_default()),
        StreamFrame::Heartbeat => Event::default().comment("heartbeat"),
    };
    Ok(event)
}
