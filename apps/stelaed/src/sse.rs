use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::SecondsFormat;
use futures::StreamExt as _;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::app::AppState;

const HEARTBEAT: Duration = Duration::from_secs(15);
const READY_POLL: Duration = Duration::from_secs(1);

fn sse_headers(response: &mut Response, session_id: &str) {
    let headers = response.headers_mut();
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(v) = HeaderValue::from_str(session_id) {
        headers.insert("mcp-session-id", v);
    }
}

/// `HEAD /…/mcp`: SSE response headers plus a fresh session id, no body.
pub async fn facade_head(State(_state): State<AppState>) -> Response {
    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("text/event-stream"),
    );
    sse_headers(&mut response, &Uuid::new_v4().to_string());
    response
}

/// `GET /…/mcp`: the facade SSE stream.
///
/// Frames, in order: an immediate comment to open proxies, the `endpoint`
/// event carrying the session-scoped message URL, the one-shot `ready` event
/// (immediately or as soon as the readiness snapshot publishes), then
/// keep-alive comments every 15 seconds until the client goes away.
pub async fn facade_sse(State(state): State<AppState>) -> Response {
    let session_id = Uuid::new_v4().to_string();
    let endpoint = public_message_endpoint(&state, &session_id);
    info!(session = %session_id, endpoint = %endpoint, "sse session");

    let (tx, rx) = mpsc::channel::<Event>(16);
    tokio::spawn(stream_frames(state, endpoint, tx));

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(HEARTBEAT).text(""))
        .into_response();
    sse_headers(&mut response, &session_id);
    response
}

fn public_message_endpoint(state: &AppState, session_id: &str) -> String {
    let mut url = state.base_url.clone();
    url.set_path(&state.mcp_path());
    url.set_query(None);
    format!("{url}?sessionId={session_id}")
}

async fn stream_frames(state: AppState, endpoint: String, tx: mpsc::Sender<Event>) {
    // Immediate tick so buffering proxies open the stream.
    if tx.send(Event::default().comment("")).await.is_err() {
        return;
    }

    if !endpoint.is_empty() {
        let event = endpoint_event(&endpoint);
        if tx.send(event).await.is_err() {
            return;
        }
    }

    let mut announced = emit_ready(&state, &tx).await;
    if announced.is_err() {
        return;
    }

    if !announced.unwrap_or(false) {
        let mut ticker = tokio::time::interval(READY_POLL);
        ticker.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    announced = emit_ready(&state, &tx).await;
                    match announced {
                        Ok(true) | Err(()) => break,
                        Ok(false) => {}
                    }
                }
                _ = tx.closed() => return,
            }
        }
    }

    // Keep-alive comments come from the Sse layer; hold the channel open
    // until the client disconnects.
    tx.closed().await;
}

/// The `endpoint` event payload. When the URL carries a `sessionId` /
/// `session_id`, it becomes the mount path with the session id appended
/// dash-free; otherwise the raw endpoint string is forwarded.
fn endpoint_payload(endpoint: &str) -> String {
    if let Ok(parsed) = Url::parse(endpoint) {
        let mut mount = parsed.path().to_string();
        if mount.is_empty() {
            mount = "/mcp".to_string();
        }
        if !mount.starts_with('/') {
            mount = format!("/{mount}");
        }
        let session = parsed
            .query_pairs()
            .find(|(key, _)| key == "sessionId" || key == "session_id")
            .map(|(_, value)| value.to_string())
            .filter(|s| !s.is_empty());
        if let Some(session) = session {
            let hex = session.replace('-', "");
            return format!("{mount}?session_id={hex}");
        }
    }
    endpoint.to_string()
}

fn endpoint_event(endpoint: &str) -> Event {
    Event::default().event("endpoint").data(endpoint_payload(endpoint))
}

/// Send the `ready` event if the snapshot is published. `Ok(true)` once
/// sent, `Ok(false)` when still warming up, `Err(())` when the client left.
async fn emit_ready(state: &AppState, tx: &mpsc::Sender<Event>) -> Result<bool, ()> {
    let Some(snapshot) = state.readiness() else {
        return Ok(false);
    };
    let payload = json!({
        "state": "ready",
        "readyAt": snapshot.ready_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        "serverCount": snapshot.server_count,
    });
    let event = Event::default()
        .event("ready")
        .json_data(&payload)
        .unwrap_or_default();
    tx.send(event).await.map(|_| true).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_payload_strips_dashes_from_session() {
        let payload = endpoint_payload(
            "http://localhost:9090/base/mcp?sessionId=123e4567-e89b-12d3-a456-426614174000",
        );
        assert_eq!(
            payload,
            "/base/mcp?session_id=123e4567e89b12d3a456426614174000"
        );
    }

    #[test]
    fn endpoint_payload_accepts_snake_case_session_param() {
        let payload = endpoint_payload("http://localhost/mcp?session_id=ab-cd");
        assert_eq!(payload, "/mcp?session_id=abcd");
    }

    #[test]
    fn endpoint_payload_passes_through_unparseable_urls() {
        assert_eq!(endpoint_payload("not a url"), "not a url");
    }
}
