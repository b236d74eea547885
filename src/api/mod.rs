//! HTTP surface.
//!
//! Ingress (§push), queries, hazard/SOS submission, health, and the
//! socket upgrade, assembled into one router over the service registry.

pub mod alerts;
pub mod ingest;
pub mod query;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::broker::session::websocket_handler;
use crate::state::{AppState, ConsumerHeartbeats};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/vehicles/:id/location",
            post(ingest::push_location).get(query::get_current),
        )
        .route("/api/vehicles/batch/locations", post(ingest::push_batch))
        .route("/api/vehicles/:id/history", get(query::get_history))
        .route("/api/nearby", get(query::get_nearby))
        .route("/api/reports", post(alerts::submit_report))
        .route("/api/sos", post(alerts::submit_sos))
        .route("/ws", get(websocket_handler))
        .route("/health", get(health))
        .with_state(state)
}

/// Liveness plus component flags.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let hb = &state.heartbeats;
    Json(json!({
        "status": "ok",
        "cacheBackend": state.cache.backend(),
        "busEnabled": state.bus.is_enabled(),
        "storeReachable": state.store.ping(),
        "sessions": state.broker.session_count(),
        "rooms": state.broker.room_count(),
        "consumers": {
            "dbWriterAgeMs": ConsumerHeartbeats::age_ms(&hb.db_writer),
            "fanoutAgeMs": ConsumerHeartbeats::age_ms(&hb.fanout),
            "alertsAgeMs": ConsumerHeartbeats::age_ms(&hb.alerts),
            "eventsAgeMs": ConsumerHeartbeats::age_ms(&hb.events),
        },
    }))
}
