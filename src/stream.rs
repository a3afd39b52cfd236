use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::store::LiveCache;

/// How often each connection polls the latest cache.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How often a ping goes out.
const PING_INTERVAL: Duration = Duration::from_secs(54);
/// A connection with no pong for this long is considered dead.
const PONG_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct StreamState {
    pub cache: Arc<dyn LiveCache>,
    pub cancel: CancellationToken,
}

/// Suppresses pushes whose serialized payload matches the previous push on
/// this connection.
#[derive(Default)]
struct PayloadDedup {
    last: Option<blake3::Hash>,
}

impl PayloadDedup {
    fn changed(&mut self, payload: &str) -> bool {
        let digest = blake3::hash(payload.as_bytes());
        if self.last == Some(digest) {
            return false;
        }
        self.last = Some(digest);
        true
    }
}

pub fn router(state: StreamState) -> Router {
    Router::new()
        .route("/ws/meters/:device_id", get(meter_stream))
        .with_state(state)
}

/// Serve the live stream until the server fails or `state.cancel` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: StreamState,
) -> std::io::Result<()> {
    let cancel = state.cancel.clone();
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

async fn meter_stream(
    ws: WebSocketUpgrade,
    Path(device_id): Path<String>,
    State(state): State<StreamState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_device(socket, device_id, state))
}

/// Per-connection loop: poll the device's latest entry and push it when it
/// changes; ping on a timer and drop the connection once pongs stop.
async fn stream_device(socket: WebSocket, device_id: String, state: StreamState) {
    metrics::counter!("stream_connections_total").increment(1);
    tracing::info!(device = %device_id, "stream subscriber connected");

    let (mut sender, mut receiver) = socket.split();
    let mut dedup = PayloadDedup::default();

    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            _ = poll.tick() => {
                let sample = match state.cache.latest(&device_id).await {
                    Ok(Some(sample)) => sample,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(device = %device_id, error = %e, "latest-cache read failed");
                        continue;
                    }
                };

                let payload = match serde_json::to_string(&sample) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(device = %device_id, error = %e, "sample serialization failed");
                        continue;
                    }
                };
                if !dedup.changed(&payload) {
                    continue;
                }

                if sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
                metrics::counter!("stream_pushes_total").increment(1);
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > PONG_DEADLINE {
                    tracing::debug!(device = %device_id, "pong deadline missed, dropping connection");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(device = %device_id, error = %e, "socket read failed");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(device = %device_id, "stream subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_payloads_are_pushed_once() {
        let mut dedup = PayloadDedup::default();
        let payload = r#"{"device_id":"meter-01","power":1150.0}"#;

        assert!(dedup.changed(payload));
        assert!(!dedup.changed(payload));
        assert!(!dedup.changed(payload));
    }

    #[test]
    fn a_changed_payload_is_pushed_again() {
        let mut dedup = PayloadDedup::default();

        assert!(dedup.changed(r#"{"power":1150.0}"#));
        assert!(dedup.changed(r#"{"power":1160.0}"#));
        assert!(!dedup.changed(r#"{"power":1160.0}"#));
        // Flapping back to an older payload still counts as a change.
        assert!(dedup.changed(r#"{"power":1150.0}"#));
    }
}
