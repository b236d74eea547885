//! Read-path handlers: current position, history, nearby snapshot.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ApiError;
use crate::models::{now_millis, NearbyVehicle, Position};
use crate::state::AppState;

/// Nearby snapshot window.
pub const NEARBY_WINDOW_MS: i64 = 60_000;
/// Hard ceiling on the nearby radius.
pub const NEARBY_MAX_RADIUS_KM: f64 = 5.0;
/// Result cap for a nearby snapshot.
pub const NEARBY_CAP: usize = 100;
/// History page-size ceiling.
pub const HISTORY_MAX_LIMIT: u32 = 1000;

#[derive(Debug, Serialize)]
pub struct CurrentResponse {
    #[serde(flatten)]
    pub position: Position,
    #[serde(rename = "_source")]
    pub source: &'static str,
}

/// GET /api/vehicles/:id/location — cache first, history on miss, with
/// cache repopulation so the next read is hot again.
pub async fn get_current(
    Path(vehicle_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<CurrentResponse>, ApiError> {
    match state.cache.get(&vehicle_id).await {
        Ok(Some(position)) => {
            return Ok(Json(CurrentResponse {
                position,
                source: "cache",
            }));
        }
        Ok(None) => {}
        Err(e) => {
            warn!(vehicle_id, error = %e, "cache read failed, falling back to history");
        }
    }

    match state.store.latest_position(&vehicle_id)? {
        Some(position) => {
            if let Err(e) = state.cache.put(&position).await {
                warn!(vehicle_id, error = %e, "cache repopulation failed");
            }
            Ok(Json(CurrentResponse {
                position,
                source: "history",
            }))
        }
        None => Err(ApiError::NotFound(format!(
            "no position known for vehicle {vehicle_id}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub vehicle_id: String,
    pub page: u32,
    pub limit: u32,
    pub count: usize,
    pub positions: Vec<Position>,
}

/// GET /api/vehicles/:id/history — reverse-chronological pages.
pub async fn get_history(
    Path(vehicle_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(100).clamp(1, HISTORY_MAX_LIMIT);

    let positions = state
        .store
        .history(&vehicle_id, query.from, query.to, page, limit)?;

    Ok(Json(HistoryResponse {
        vehicle_id,
        page,
        limit,
        count: positions.len(),
        positions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct NearbyResponse {
    pub count: usize,
    pub vehicles: Vec<NearbyVehicle>,
}

/// GET /api/nearby — point-in-time snapshot over the last 60 seconds of
/// history, one row per vehicle, nearest first.
pub async fn get_nearby(
    Query(query): Query<NearbyQuery>,
    State(state): State<AppState>,
) -> Result<Json<NearbyResponse>, ApiError> {
    let mut errors = Vec::new();
    if !(-90.0..=90.0).contains(&query.lat) {
        errors.push(format!("lat {} out of range [-90, 90]", query.lat));
    }
    if !(-180.0..=180.0).contains(&query.lng) {
        errors.push(format!("lng {} out of range [-180, 180]", query.lng));
    }
    let radius = query.radius.unwrap_or(1.0);
    if radius <= 0.0 || !radius.is_finite() {
        errors.push(format!("radius {radius} must be positive"));
    }
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let radius = radius.min(NEARBY_MAX_RADIUS_KM);
    let window_start = now_millis() - NEARBY_WINDOW_MS;
    let vehicles = state
        .store
        .nearby(query.lat, query.lng, radius, window_start, NEARBY_CAP)?;

    Ok(Json(NearbyResponse {
        count: vehicles.len(),
        vehicles,
    }))
}
