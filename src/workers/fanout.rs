//! Fan-out workers.
//!
//! `websocket-fanout` coalesces each location batch to one record per
//! vehicle before touching the broker, so subscriber cost is bounded by
//! the fleet size, not the ingest rate. `alert-processor` and
//! `event-processor` broadcast hazards, SOS signals, and status flips
//! record-by-record; those are individually meaningful.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::broker::{vehicle_room, RoomPublisher, ROOM_NEARBY_ALL};
use crate::bus::{
    FETCH_BYTE_BUDGET, GROUP_ALERTS, GROUP_EVENTS, GROUP_FANOUT, TOPIC_ALERTS, TOPIC_EVENTS,
    TOPIC_LOCATIONS,
};
use crate::models::{HazardReport, MovedVehicle, Position, SosEvent, VehicleStatus, WsServerEvent};
use crate::state::{AppState, ConsumerHeartbeats};

pub async fn run_locations(state: AppState) {
    info!(group = GROUP_FANOUT, "fan-out worker started");
    loop {
        let processed = run_locations_cycle(&state);
        ConsumerHeartbeats::beat(&state.heartbeats.fanout);
        if processed == 0 {
            state.bus.wait_for_records(TOPIC_LOCATIONS).await;
        }
    }
}

/// One pass over every partition of `vehicle-locations`.
pub fn run_locations_cycle(state: &AppState) -> usize {
    let mut consumed = 0;
    for partition in 0..state.bus.partition_count(TOPIC_LOCATIONS) {
        let batch = state
            .bus
            .fetch(TOPIC_LOCATIONS, GROUP_FANOUT, partition, FETCH_BYTE_BUDGET);
        if batch.is_empty() {
            continue;
        }
        let next_offset = batch.last().map(|r| r.offset + 1).unwrap_or(0);
        consumed += batch.len();

        // Offset order; later records overwrite earlier ones.
        let mut latest: HashMap<String, Position> = HashMap::new();
        for record in batch {
            match serde_json::from_value::<Position>(record.payload) {
                Ok(pos) => {
                    latest.insert(pos.vehicle_id.clone(), pos);
                }
                Err(e) => {
                    warn!(partition, offset = record.offset, error = %e, "dropping unparsable record");
                }
            }
        }

        let mut summary: Vec<MovedVehicle> = Vec::with_capacity(latest.len());
        for pos in latest.values() {
            summary.push(MovedVehicle::from(pos));
            state
                .broker
                .push_to_room(&vehicle_room(&pos.vehicle_id), WsServerEvent::VehicleMoved(pos.clone()));
        }
        if !summary.is_empty() {
            state
                .broker
                .push_to_room(ROOM_NEARBY_ALL, WsServerEvent::BatchMoved(summary));
        }

        state
            .bus
            .commit(TOPIC_LOCATIONS, GROUP_FANOUT, partition, next_offset);
    }
    consumed
}

pub async fn run_alerts(state: AppState) {
    info!(group = GROUP_ALERTS, "alert processor started");
    loop {
        let processed = run_alerts_cycle(&state);
        ConsumerHeartbeats::beat(&state.heartbeats.alerts);
        if processed == 0 {
            state.bus.wait_for_records(TOPIC_ALERTS).await;
        }
    }
}

/// Hazard broadcasts: no coalescing, every record goes out.
pub fn run_alerts_cycle(state: &AppState) -> usize {
    let mut consumed = 0;
    for partition in 0..state.bus.partition_count(TOPIC_ALERTS) {
        let batch = state
            .bus
            .fetch(TOPIC_ALERTS, GROUP_ALERTS, partition, FETCH_BYTE_BUDGET);
        if batch.is_empty() {
            continue;
        }
        let next_offset = batch.last().map(|r| r.offset + 1).unwrap_or(0);
        consumed += batch.len();

        for record in batch {
            let event = match serde_json::from_value::<HazardReport>(record.payload.clone()) {
                Ok(report) => WsServerEvent::NewHazard(report),
                Err(_) => WsServerEvent::RouteAlert(record.payload),
            };
            state.broker.push_to_room(ROOM_NEARBY_ALL, event);
        }

        state
            .bus
            .commit(TOPIC_ALERTS, GROUP_ALERTS, partition, next_offset);
    }
    consumed
}

pub async fn run_events(state: AppState) {
    info!(group = GROUP_EVENTS, "event processor started");
    loop {
        let processed = run_events_cycle(&state);
        ConsumerHeartbeats::beat(&state.heartbeats.events);
        if processed == 0 {
            state.bus.wait_for_records(TOPIC_EVENTS).await;
        }
    }
}

/// Status flips and SOS signals from the vehicle-events topic.
pub fn run_events_cycle(state: &AppState) -> usize {
    let mut consumed = 0;
    for partition in 0..state.bus.partition_count(TOPIC_EVENTS) {
        let batch = state
            .bus
            .fetch(TOPIC_EVENTS, GROUP_EVENTS, partition, FETCH_BYTE_BUDGET);
        if batch.is_empty() {
            continue;
        }
        let next_offset = batch.last().map(|r| r.offset + 1).unwrap_or(0);
        consumed += batch.len();

        for record in batch {
            let kind = record.payload.get("kind").and_then(|k| k.as_str()).unwrap_or("");
            match kind {
                "sos" => {
                    match serde_json::from_value::<SosEvent>(record.payload["event"].clone()) {
                        Ok(event) => state
                            .broker
                            .push_to_room(ROOM_NEARBY_ALL, WsServerEvent::SosAlert(event)),
                        Err(e) => {
                            warn!(partition, offset = record.offset, error = %e, "dropping unparsable sos event")
                        }
                    }
                }
                "status" => {
                    if let Some(vehicle_id) =
                        record.payload.get("vehicleId").and_then(|v| v.as_str())
                    {
                        state.broker.push_to_room(
                            ROOM_NEARBY_ALL,
                            WsServerEvent::StatusChanged {
                                vehicle_id: vehicle_id.to_string(),
                                status: VehicleStatus::Active,
                            },
                        );
                    }
                }
                other => {
                    warn!(partition, offset = record.offset, kind = other, "unknown event kind dropped")
                }
            }
        }

        state
            .bus
            .commit(TOPIC_EVENTS, GROUP_EVENTS, partition, next_offset);
    }
    consumed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtHandler;
    use crate::broker::Broker;
    use crate::bus::EventBus;
    use crate::cache::memory::InMemoryCache;
    use crate::middleware::{IpRateLimiter, RateLimitConfig};
    use crate::models::{Config, HazardKind};
    use crate::store::HistoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn test_state() -> AppState {
        let config = Config {
            port: 0,
            db_path: ":memory:".into(),
            redis_url: None,
            event_bus_enabled: true,
            jwt_secret: "test-secret".into(),
            client_url: None,
        };
        AppState::new(
            config,
            Arc::new(HistoryStore::new(":memory:").unwrap()),
            Arc::new(InMemoryCache::new()),
            Arc::new(EventBus::new(true)),
            Arc::new(Broker::new()),
            Arc::new(JwtHandler::new("test-secret".into())),
            IpRateLimiter::new(RateLimitConfig::sos()),
        )
    }

    fn payload(id: &str, lat: f64, ts: i64) -> serde_json::Value {
        json!({
            "vehicleId": id,
            "lat": lat,
            "lng": 77.59,
            "speed": 30.0,
            "heading": 90.0,
            "accuracy": 0.0,
            "altitude": 0.0,
            "timestamp": ts,
        })
    }

    #[tokio::test]
    async fn batch_is_coalesced_to_latest_per_vehicle() {
        let state = test_state();
        let (session, mut rx) = state.broker.register();
        state.broker.join(session, &vehicle_room("veh_1"));

        for ts in [100, 200, 300] {
            state
                .bus
                .publish(TOPIC_LOCATIONS, "veh_1", payload("veh_1", 12.0, ts))
                .await;
        }

        assert_eq!(run_locations_cycle(&state), 3);

        // One vehicle-moved for the room, one coalesced summary for
        // nearby-all, nothing else.
        let mut moved = Vec::new();
        let mut summaries = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                WsServerEvent::VehicleMoved(p) => moved.push(p),
                WsServerEvent::BatchMoved(s) => summaries.push(s),
                _ => {}
            }
        }
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].timestamp, 300);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].len(), 1);
    }

    #[tokio::test]
    async fn fanout_timestamps_are_non_decreasing_per_vehicle() {
        let state = test_state();
        let (session, mut rx) = state.broker.register();
        state.broker.join(session, &vehicle_room("veh_1"));

        let mut seen = Vec::new();
        for round in 0..5 {
            for ts in [round * 10 + 1, round * 10 + 2] {
                state
                    .bus
                    .publish(TOPIC_LOCATIONS, "veh_1", payload("veh_1", 12.0, ts))
                    .await;
            }
            run_locations_cycle(&state);
            while let Ok(event) = rx.try_recv() {
                if let WsServerEvent::VehicleMoved(p) = event {
                    seen.push(p.timestamp);
                }
            }
        }
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "timestamps regressed: {seen:?}");
    }

    #[tokio::test]
    async fn alerts_are_broadcast_individually() {
        let state = test_state();
        let (_session, mut rx) = state.broker.register();

        let report = HazardReport {
            id: "rep_1".into(),
            kind: HazardKind::Flooding,
            severity: 4,
            lat: 12.97,
            lng: 77.59,
            description: Some("road under water".into()),
            reported_by: None,
            created_at: 100,
            expires_at: 200,
        };
        state
            .bus
            .publish(TOPIC_ALERTS, "alert", serde_json::to_value(&report).unwrap())
            .await;
        state
            .bus
            .publish(TOPIC_ALERTS, "alert", json!({"advisory": "detour on NH44"}))
            .await;

        assert_eq!(run_alerts_cycle(&state), 2);

        let mut hazards = 0;
        let mut route_alerts = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                WsServerEvent::NewHazard(r) => {
                    assert_eq!(r.kind, HazardKind::Flooding);
                    hazards += 1;
                }
                WsServerEvent::RouteAlert(_) => route_alerts += 1,
                _ => {}
            }
        }
        assert_eq!((hazards, route_alerts), (1, 1));
    }

    #[tokio::test]
    async fn sos_and_status_events_reach_the_global_room() {
        let state = test_state();
        let (_session, mut rx) = state.broker.register();

        let sos = SosEvent {
            id: "sos_1".into(),
            user_id: "user_1".into(),
            vehicle_id: Some("veh_1".into()),
            lat: 12.97,
            lng: 77.59,
            message: None,
            created_at: 100,
        };
        state
            .bus
            .publish(
                TOPIC_EVENTS,
                "sos",
                json!({"kind": "sos", "event": serde_json::to_value(&sos).unwrap()}),
            )
            .await;
        state
            .bus
            .publish(
                TOPIC_EVENTS,
                "status",
                json!({"kind": "status", "vehicleId": "veh_2", "status": "active"}),
            )
            .await;

        assert_eq!(run_events_cycle(&state), 2);

        let mut saw_sos = false;
        let mut saw_status = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                WsServerEvent::SosAlert(e) => {
                    assert_eq!(e.user_id, "user_1");
                    saw_sos = true;
                }
                WsServerEvent::StatusChanged { vehicle_id, .. } => {
                    assert_eq!(vehicle_id, "veh_2");
                    saw_status = true;
                }
                _ => {}
            }
        }
        assert!(saw_sos && saw_status);
    }
}
