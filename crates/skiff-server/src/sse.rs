use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use skiff_core::ids::SessionId;

use crate::server::AppState;

const REPLAY_BATCH: u32 = 5000;

#[derive(Debug, Deserialize)]
pub struct EventStreamParams {
    pub session_id: Option<String>,
    pub since: Option<i64>,
}

/// `GET /event`: the long-lived SSE subscription.
///
/// Protocol: a `connected` message (no id), then replay of persisted events
/// with `id > since` (from the query or `Last-Event-ID` header), then live
/// delivery. Periodic `heartbeat` messages keep idle connections open.
/// If the subscriber falls behind the broadcast queue the stream ends; the
/// client reconnects with its last id and replay fills the gap.
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventStreamParams>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_filter = params.session_id.map(SessionId::from_raw);
    let since = params.since.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    });

    let heartbeat = state.config.heartbeat;
    let stream = async_stream::stream! {
        // Subscribe before snapshotting the replay so no event falls in the
        // gap between the two; duplicates at the seam are filtered by id.
        let mut rx = state.bus.subscribe();

        let latest_id = state.bus.latest_id().unwrap_or(0);
        let connected = serde_json::json!({
            "type": "connected",
            "ts": now_ts(),
            "payload": {
                "server_time": chrono::Utc::now().to_rfc3339(),
                "latest_id": latest_id,
            },
        });
        yield Ok(Event::default().event("connected").data(connected.to_string()));

        // Replay in pages until a short page shows the backlog is drained;
        // a single capped query would silently drop events past the cap.
        let mut last_id = since.unwrap_or(0);
        loop {
            let page = match state.bus.replay(session_filter.as_ref(), Some(last_id), REPLAY_BATCH)
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "SSE replay failed");
                    return;
                }
            };
            let page_full = page.len() as u32 == REPLAY_BATCH;
            if page_full {
                warn!(
                    after_id = last_id,
                    page_size = REPLAY_BATCH,
                    "SSE replay page filled to cap; fetching next page"
                );
            }
            for envelope in page {
                last_id = envelope.id;
                if let Some(event) = envelope_event(&envelope) {
                    yield Ok(event);
                }
            }
            if !page_full {
                break;
            }
        }

        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();

        loop {
            let next = tokio::select! {
                received = rx.recv() => match received {
                    Ok(envelope) => {
                        let in_session = session_filter
                            .as_ref()
                            .map(|filter| &envelope.session_id == filter)
                            .unwrap_or(true);
                        // Events already sent during replay are skipped.
                        if in_session && envelope.id > last_id {
                            last_id = envelope.id;
                            envelope_event(&envelope)
                        } else {
                            None
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "SSE subscriber lagged; dropping stream for reconnect");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("event bus closed; ending SSE stream");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let hb = serde_json::json!({
                        "type": "heartbeat",
                        "ts": now_ts(),
                        "payload": {},
                    });
                    Some(Event::default().event("heartbeat").data(hb.to_string()))
                }
            };
            if let Some(event) = next {
                yield Ok(event);
            }
        }
    };

    Sse::new(stream)
}

fn envelope_event(envelope: &skiff_core::events::EventEnvelope) -> Option<Event> {
    match serde_json::to_string(envelope) {
        Ok(data) => Some(
            Event::default()
                .id(envelope.id.to_string())
                .event("event")
                .data(data),
        ),
        Err(e) => {
            warn!(id = envelope.id, error = %e, "failed to serialize event envelope");
            None
        }
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
