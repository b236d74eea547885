//! Socket session loop.
//!
//! One task per connection. Outbound events arrive on the session's
//! broker queue; inbound frames carry the named client events. The
//! handshake credential decides authenticated vs anonymous — an invalid
//! token downgrades rather than rejecting the connection.

use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{fleet_room, vehicle_room, LIVENESS_TIMEOUT, PING_INTERVAL};
use crate::api::query::{NEARBY_CAP, NEARBY_WINDOW_MS};
use crate::models::{now_millis, WsClientMessage, WsServerEvent};
use crate::pipeline::{self, PushOutcome};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let token = query.token.or_else(|| {
        headers
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|t| t.to_string())
    });

    let user_id = token.and_then(|t| match state.jwt.validate_token(&t) {
        Ok(claims) => Some(claims.sub),
        Err(_) => {
            debug!("handshake token rejected, downgrading to anonymous");
            None
        }
    });

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user_id: Option<String>) {
    let (session_id, mut rx) = state.broker.register();
    info!(session_id, authenticated = user_id.is_some(), "socket session opened");

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                    warn!(error = %e, "failed to serialize ws event");
                    "{}".to_string()
                });
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(msg)) => {
                        last_seen = Instant::now();
                        match msg {
                            Message::Text(text) => {
                                handle_client_message(&state, session_id, user_id.as_deref(), &text).await;
                            }
                            Message::Close(_) => break,
                            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
                        }
                    }
                    Some(Err(_)) | None => break,
                }
            }
            _ = ping_timer.tick() => {
                if last_seen.elapsed() > LIVENESS_TIMEOUT {
                    debug!(session_id, "liveness timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.broker.disconnect(session_id);
}

fn send_error(state: &AppState, session_id: u64, code: &str, message: impl Into<String>) {
    state.broker.send_to_session(
        session_id,
        WsServerEvent::Error {
            code: code.to_string(),
            message: message.into(),
        },
    );
}

pub(crate) async fn handle_client_message(
    state: &AppState,
    session_id: u64,
    user_id: Option<&str>,
    text: &str,
) {
    let msg = match serde_json::from_str::<WsClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            send_error(state, session_id, "INVALID_MESSAGE", e.to_string());
            return;
        }
    };

    match msg {
        WsClientMessage::SubscribeVehicle { vehicle_id } => {
            state.broker.join(session_id, &vehicle_room(&vehicle_id));

            // Immediate snapshot: cache entry, else the newest history
            // record, else nothing.
            let snapshot = match state.cache.get(&vehicle_id).await {
                Ok(Some(pos)) => Some(pos),
                _ => state.store.latest_position(&vehicle_id).ok().flatten(),
            };
            if let Some(pos) = snapshot {
                state
                    .broker
                    .send_to_session(session_id, WsServerEvent::Location(pos));
            }
        }
        WsClientMessage::UnsubscribeVehicle { vehicle_id } => {
            state.broker.leave(session_id, &vehicle_room(&vehicle_id));
        }
        WsClientMessage::SubscribeFleet { fleet_id } => {
            state.broker.join(session_id, &fleet_room(&fleet_id));
        }
        WsClientMessage::PushLocation(update) => {
            if user_id.is_none() {
                send_error(
                    state,
                    session_id,
                    "AUTH_REQUIRED",
                    "push:location requires an authenticated session",
                );
                return;
            }
            let vehicle_id = update.vehicle_id;
            match update.update.into_position(&vehicle_id, now_millis()) {
                Err(errors) => {
                    send_error(state, session_id, "VALIDATION_FAILED", errors.join("; "));
                }
                Ok(pos) => match pipeline::push_single(state, pos).await {
                    Ok(PushOutcome::Throttled) => {
                        send_error(state, session_id, "THROTTLED", "too many location updates");
                    }
                    Ok(_) => {}
                    Err(_) => {
                        send_error(state, session_id, "INTERNAL", "location push failed");
                    }
                },
            }
        }
        WsClientMessage::GetNearby { lat, lng } => {
            let window_start = now_millis() - NEARBY_WINDOW_MS;
            match state.store.nearby(lat, lng, 1.0, window_start, NEARBY_CAP) {
                Ok(vehicles) => {
                    state
                        .broker
                        .send_to_session(session_id, WsServerEvent::NearbySnapshot(vehicles));
                }
                Err(e) => {
                    warn!(session_id, error = %e, "nearby snapshot failed");
                    send_error(state, session_id, "INTERNAL", "nearby snapshot failed");
                }
            }
        }
        WsClientMessage::Ping { timestamp } => {
            state.broker.send_to_session(
                session_id,
                WsServerEvent::Pong {
                    timestamp: timestamp.unwrap_or(0),
                },
            );
        }
    }
}
