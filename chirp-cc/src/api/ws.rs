//! Subscription gateway
//!
//! Long-lived WebSocket sessions, one per connected client. A session
//! authenticates from the `token` query parameter, subscribes to its
//! user's event topic, and fans events out as JSON frames. The gateway
//! never originates business events.
//!
//! Liveness is application-level: the server sends a `ping` frame on a
//! fixed cadence and closes after three unanswered pings. A client whose
//! send buffer stays saturated past a grace period is closed with an
//! overloaded code; it reconnects and resynchronizes via the capture
//! list.

use super::auth;
use crate::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How long a saturated client buffer is tolerated before the session
/// is closed as overloaded
const SATURATION_GRACE: Duration = Duration::from_secs(5);
/// Unanswered pings before the peer is considered gone
const MAX_MISSED_PONGS: u32 = 3;
/// Outbound frame buffer per session
const SEND_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /v1/ws?token=... - upgrade to a subscription session
pub async fn upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| session(socket, state, query.token))
}

/// Tracks unanswered application-level pings
#[derive(Debug, Default)]
struct PongTracker {
    outstanding: u32,
}

impl PongTracker {
    /// Called at each ping tick; true means the peer is gone
    fn ping_due(&mut self) -> bool {
        if self.outstanding >= MAX_MISSED_PONGS {
            return true;
        }
        self.outstanding += 1;
        false
    }

    fn pong_received(&mut self) {
        self.outstanding = 0;
    }
}

/// Tracks send-buffer saturation and dropped frames
#[derive(Debug)]
struct SaturationGauge {
    saturated_since: Option<Instant>,
    grace: Duration,
    dropped: u64,
}

impl SaturationGauge {
    fn new(grace: Duration) -> Self {
        Self {
            saturated_since: None,
            grace,
            dropped: 0,
        }
    }

    /// A frame was dropped because the buffer was full; true means the
    /// grace period is spent and the session should close
    fn frame_dropped(&mut self, now: Instant) -> bool {
        self.dropped += 1;
        let since = *self.saturated_since.get_or_insert(now);
        now.duration_since(since) > self.grace
    }

    /// A frame went through; the buffer is draining again
    fn frame_sent(&mut self) {
        self.saturated_since = None;
    }

    fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Events the subscriber missed upstream (bus lag)
    fn add_lagged(&mut self, n: u64) {
        self.dropped += n;
    }
}

async fn session(mut socket: WebSocket, state: AppState, token: Option<String>) {
    // Authenticate before anything else flows.
    let user = match token {
        Some(token) => auth::authenticate_token(&state.db, &token).await.ok(),
        None => None,
    };
    let Some(user) = user else {
        tracing::info!("Gateway session rejected: invalid token");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "invalid token".into(),
            })))
            .await;
        return;
    };

    tracing::info!(user = %user.handle, "Gateway session opened");
    let mut events = state.bus.subscribe(user.id);

    let (mut sink, mut stream) = socket.split();

    // Sender task: the only writer to the socket. Session logic talks to
    // it through a bounded channel so backpressure is observable.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(SEND_BUFFER);
    let send_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let last = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || last {
                break;
            }
        }
    });

    let mut pongs = PongTracker::default();
    let mut gauge = SaturationGauge::new(SATURATION_GRACE);
    let mut ping_tick = tokio::time::interval(state.ws_ping_interval);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_tick.tick().await; // first tick is immediate; skip it

    let close_reason: Option<CloseFrame> = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                break Some(CloseFrame {
                    code: close_code::RESTART,
                    reason: "shutting down".into(),
                });
            }

            _ = ping_tick.tick() => {
                if pongs.ping_due() {
                    tracing::info!(user = %user.handle, "Gateway peer unresponsive");
                    break Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: "ping timeout".into(),
                    });
                }
                let frame = serde_json::json!({
                    "type": "ping",
                    "dropped": gauge.dropped(),
                })
                .to_string();
                if out_tx.try_send(Message::Text(frame)).is_err()
                    && gauge.frame_dropped(Instant::now())
                {
                    break Some(overloaded());
                }
            }

            received = events.recv() => {
                match received {
                    Ok(event) => {
                        let frame = match serde_json::to_string(&event) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::warn!(error = %e, "Event serialization failed");
                                continue;
                            }
                        };
                        match out_tx.try_send(Message::Text(frame)) {
                            Ok(()) => gauge.frame_sent(),
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                if gauge.frame_dropped(Instant::now()) {
                                    tracing::info!(user = %user.handle, "Gateway session overloaded");
                                    break Some(overloaded());
                                }
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break None,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Missed upstream; surfaced to the client via the
                        // dropped counter on the next ping.
                        gauge.add_lagged(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break None,
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                            if value.get("type").and_then(|t| t.as_str()) == Some("pong") {
                                pongs.pong_received();
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => pongs.pong_received(),
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(user = %user.handle, error = %e, "Gateway receive error");
                        break None;
                    }
                }
            }
        }
    };

    if let Some(frame) = close_reason {
        let _ = out_tx.try_send(Message::Close(Some(frame)));
        // Give the sender a moment to flush the close frame.
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            out_tx.closed().await;
        })
        .await;
    }
    drop(out_tx);
    let _ = send_task.await;
    tracing::info!(user = %user.handle, dropped = gauge.dropped(), "Gateway session closed");
}

fn overloaded() -> CloseFrame<'static> {
    CloseFrame {
        code: close_code::AGAIN,
        reason: "overloaded".into(),
    }
}
