//! Ingest pipeline.
//!
//! The shared write path behind the HTTP ingress and the socket
//! `push:location` channel: gate → hot cache → log publish, with the
//! direct-write fallback when the log rejects. Response latency never
//! depends on persistence in the happy path; the log decouples it.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::broker::{vehicle_room, RoomPublisher, ROOM_NEARBY_ALL};
use crate::bus::{TOPIC_EVENTS, TOPIC_LOCATIONS};
use crate::error::ApiError;
use crate::gate::{self, GateDecision};
use crate::models::{now_millis, MovedVehicle, Position, VehicleStatus, WsServerEvent};
use crate::state::AppState;

/// Soft end-to-end deadline for the gate's cache round trips; on expiry
/// the request proceeds without their contribution.
pub const GATE_DEADLINE: Duration = Duration::from_secs(2);

/// Largest accepted batch push.
pub const MAX_BATCH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Cached, published (or directly written), visible to reads.
    Accepted,
    /// Inside the dead zone; nothing forwarded downstream.
    AcceptedNoMotion,
    Throttled,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    pub processed: usize,
    pub rejected: usize,
    /// First ten offending vehicle ids, for the response body.
    pub rejected_ids: Vec<String>,
}

pub async fn push_single(state: &AppState, pos: Position) -> Result<PushOutcome, ApiError> {
    let decision = match tokio::time::timeout(
        GATE_DEADLINE,
        gate::evaluate(state.cache.as_ref(), &pos.vehicle_id, pos.lat, pos.lng),
    )
    .await
    {
        Ok(decision) => decision,
        Err(_) => {
            debug!(vehicle_id = %pos.vehicle_id, "gate deadline exceeded, failing open");
            GateDecision::Forward
        }
    };

    match decision {
        GateDecision::Throttled => return Ok(PushOutcome::Throttled),
        GateDecision::NoMotion => return Ok(PushOutcome::AcceptedNoMotion),
        GateDecision::Forward => {}
    }

    if let Err(e) = state.cache.put(&pos).await {
        warn!(vehicle_id = %pos.vehicle_id, error = %e, "cache write failed, continuing");
    }

    let payload = serde_json::to_value(&pos).map_err(|e| ApiError::Internal(e.into()))?;
    if !state.bus.publish(TOPIC_LOCATIONS, &pos.vehicle_id, payload).await {
        direct_write(state, std::slice::from_ref(&pos))?;
    }

    Ok(PushOutcome::Accepted)
}

/// Batch ingress: validate every element, pipeline-cache and single-send
/// the valid subset. The gate is not applied; aggregated uploads are
/// already paced by the device.
pub async fn push_batch(
    state: &AppState,
    updates: Vec<crate::models::BatchLocationUpdate>,
) -> Result<BatchResult, ApiError> {
    let received_at = now_millis();
    let mut result = BatchResult::default();
    let mut valid: Vec<Position> = Vec::with_capacity(updates.len());

    for update in updates {
        let vehicle_id = update.vehicle_id.clone();
        match update.update.into_position(&vehicle_id, received_at) {
            Ok(pos) => valid.push(pos),
            Err(_) => {
                result.rejected += 1;
                if result.rejected_ids.len() < 10 {
                    result.rejected_ids.push(vehicle_id);
                }
            }
        }
    }

    if !valid.is_empty() {
        if let Err(e) = state.cache.put_batch(&valid).await {
            warn!(count = valid.len(), error = %e, "batch cache write failed, continuing");
        }

        let mut entries = Vec::with_capacity(valid.len());
        for pos in &valid {
            let payload = serde_json::to_value(pos).map_err(|e| ApiError::Internal(e.into()))?;
            entries.push((pos.vehicle_id.clone(), payload));
        }
        if !state.bus.publish_batch(TOPIC_LOCATIONS, entries).await {
            direct_write(state, &valid)?;
        }
    }

    result.processed = valid.len();
    Ok(result)
}

/// §4.D-direct: the log is unavailable, so persist and fan out inside the
/// request path. A store failure here is a 500 and the records are lost.
fn direct_write(state: &AppState, batch: &[Position]) -> Result<(), ApiError> {
    state
        .store
        .insert_positions(batch)
        .map_err(ApiError::Internal)?;

    let mut ids: Vec<String> = batch.iter().map(|p| p.vehicle_id.clone()).collect();
    ids.sort();
    ids.dedup();

    let flipped = match state.store.mark_vehicles_active(&ids, now_millis()) {
        Ok(flipped) => flipped,
        Err(e) => {
            warn!(error = %e, "descriptor update failed on direct write");
            Vec::new()
        }
    };

    // Inline fan-out mirrors what the workers would have produced.
    let coalesced = crate::cache::coalesce_newest(batch);
    let mut summary: Vec<MovedVehicle> = Vec::with_capacity(coalesced.len());
    for pos in coalesced {
        state
            .broker
            .push_to_room(&vehicle_room(&pos.vehicle_id), WsServerEvent::VehicleMoved(pos.clone()));
        summary.push(MovedVehicle::from(pos));
    }
    state
        .broker
        .push_to_room(ROOM_NEARBY_ALL, WsServerEvent::BatchMoved(summary));

    for vehicle_id in flipped {
        state.broker.push_to_room(
            ROOM_NEARBY_ALL,
            WsServerEvent::StatusChanged {
                vehicle_id,
                status: VehicleStatus::Active,
            },
        );
    }

    Ok(())
}

/// Publish a status flip to the vehicle-events topic; used by the
/// persistence worker once descriptors change.
pub async fn publish_status_change(state: &AppState, vehicle_id: &str) -> bool {
    state
        .bus
        .publish(
            TOPIC_EVENTS,
            "status",
            json!({"kind": "status", "vehicleId": vehicle_id, "status": "active"}),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtHandler;
    use crate::broker::Broker;
    use crate::bus::{EventBus, FETCH_BYTE_BUDGET, GROUP_FANOUT};
    use crate::cache::memory::InMemoryCache;
    use crate::middleware::{IpRateLimiter, RateLimitConfig};
    use crate::models::{Config, LocationUpdate};
    use crate::store::HistoryStore;
    use std::sync::Arc;

    fn test_state(bus_enabled: bool) -> AppState {
        let config = Config {
            port: 0,
            db_path: ":memory:".into(),
            redis_url: None,
            event_bus_enabled: bus_enabled,
            jwt_secret: "test-secret".into(),
            client_url: None,
        };
        AppState::new(
            config,
            Arc::new(HistoryStore::new(":memory:").unwrap()),
            Arc::new(InMemoryCache::new()),
            Arc::new(EventBus::new(bus_enabled)),
            Arc::new(Broker::new()),
            Arc::new(JwtHandler::new("test-secret".into())),
            IpRateLimiter::new(RateLimitConfig::sos()),
        )
    }

    fn pos(id: &str, lat: f64, lng: f64, ts: i64) -> Position {
        Position {
            vehicle_id: id.to_string(),
            lat,
            lng,
            speed: 30.0,
            heading: 0.0,
            accuracy: 0.0,
            altitude: 0.0,
            timestamp: ts,
        }
    }

    fn update(id: &str, lat: f64, lng: f64) -> crate::models::BatchLocationUpdate {
        crate::models::BatchLocationUpdate {
            vehicle_id: id.to_string(),
            update: LocationUpdate {
                lat: Some(lat),
                lng: Some(lng),
                speed: None,
                heading: None,
                accuracy: None,
                altitude: None,
                timestamp: None,
            },
        }
    }

    #[tokio::test]
    async fn accepted_push_is_cached_and_published() {
        let state = test_state(true);
        let p = pos("veh_abc", 12.97, 77.59, 100);

        let outcome = push_single(&state, p.clone()).await.unwrap();
        assert_eq!(outcome, PushOutcome::Accepted);

        // Visible to reads via the cache within the same operation.
        let cached = state.cache.get("veh_abc").await.unwrap().unwrap();
        assert_eq!(cached.lat, 12.97);

        // Scheduled for persistence via the log.
        let partition = state.bus.partition_for(TOPIC_LOCATIONS, "veh_abc").unwrap();
        let batch = state.bus.fetch(TOPIC_LOCATIONS, GROUP_FANOUT, partition, FETCH_BYTE_BUDGET);
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn stationary_second_push_is_suppressed() {
        let state = test_state(true);
        let first = push_single(&state, pos("veh_1", 12.97, 77.59, 100)).await.unwrap();
        assert_eq!(first, PushOutcome::Accepted);

        let second = push_single(&state, pos("veh_1", 12.97, 77.59, 200)).await.unwrap();
        assert_eq!(second, PushOutcome::AcceptedNoMotion);

        // Exactly one record scheduled for history.
        let partition = state.bus.partition_for(TOPIC_LOCATIONS, "veh_1").unwrap();
        let batch = state.bus.fetch(TOPIC_LOCATIONS, GROUP_FANOUT, partition, FETCH_BYTE_BUDGET);
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn sixth_push_within_window_throttles() {
        let state = test_state(true);
        for i in 0..5 {
            let outcome = push_single(&state, pos("veh_x", 12.97 + i as f64 * 0.001, 77.59, i))
                .await
                .unwrap();
            assert_eq!(outcome, PushOutcome::Accepted, "push {i}");
        }
        let outcome = push_single(&state, pos("veh_x", 12.98, 77.59, 9)).await.unwrap();
        assert_eq!(outcome, PushOutcome::Throttled);
    }

    #[tokio::test]
    async fn bus_failure_falls_through_to_direct_write() {
        let state = test_state(false);
        let outcome = push_single(&state, pos("veh_1", 12.97, 77.59, 100)).await.unwrap();
        assert_eq!(outcome, PushOutcome::Accepted);

        // Persisted inside the request path.
        let stored = state.store.latest_position("veh_1").unwrap().unwrap();
        assert_eq!(stored.timestamp, 100);

        // Descriptor side effect applied inline.
        let v = state.store.get_vehicle("veh_1").unwrap().unwrap();
        assert_eq!(v.status, VehicleStatus::Active);
    }

    #[tokio::test]
    async fn batch_classifies_valid_and_invalid() {
        let state = test_state(true);
        let result = push_batch(
            &state,
            vec![update("a", 0.0, 0.0), update("b", 999.0, 0.0)],
        )
        .await
        .unwrap();

        assert_eq!(result.processed, 1);
        assert_eq!(result.rejected, 1);
        assert_eq!(result.rejected_ids, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn batch_reports_at_most_ten_rejected_ids() {
        let state = test_state(true);
        let updates: Vec<_> = (0..25).map(|i| update(&format!("bad_{i}"), 999.0, 0.0)).collect();
        let result = push_batch(&state, updates).await.unwrap();
        assert_eq!(result.rejected, 25);
        assert_eq!(result.rejected_ids.len(), 10);
        assert_eq!(result.processed, 0);
    }

    #[tokio::test]
    async fn batch_direct_write_persists_all_valid_records() {
        let state = test_state(false);
        let result = push_batch(
            &state,
            vec![update("a", 1.0, 1.0), update("b", 2.0, 2.0)],
        )
        .await
        .unwrap();
        assert_eq!(result.processed, 2);

        assert!(state.store.latest_position("a").unwrap().is_some());
        assert!(state.store.latest_position("b").unwrap().is_some());
    }

    #[tokio::test]
    async fn direct_write_broadcasts_inline() {
        let state = test_state(false);
        let (_session, mut rx) = state.broker.register();

        push_single(&state, pos("veh_1", 12.97, 77.59, 100)).await.unwrap();

        // nearby-all receives the coalesced summary and the status flip.
        let mut saw_batch = false;
        let mut saw_status = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                WsServerEvent::BatchMoved(moved) => {
                    assert_eq!(moved.len(), 1);
                    saw_batch = true;
                }
                WsServerEvent::StatusChanged { vehicle_id, .. } => {
                    assert_eq!(vehicle_id, "veh_1");
                    saw_status = true;
                }
                _ => {}
            }
        }
        assert!(saw_batch && saw_status);
    }
}
