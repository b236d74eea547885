//! Write-path handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::gate::{NEXT_PING_MS, RETRY_AFTER_MS};
use crate::models::{now_millis, BatchLocationUpdate, LocationUpdate};
use crate::pipeline::{self, PushOutcome, MAX_BATCH};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub next_ping_ms: u64,
}

/// POST /api/vehicles/:id/location
pub async fn push_location(
    Path(vehicle_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<LocationUpdate>,
) -> Result<Json<PushResponse>, ApiError> {
    let pos = body
        .into_position(&vehicle_id, now_millis())
        .map_err(ApiError::Validation)?;

    match pipeline::push_single(&state, pos).await? {
        PushOutcome::Accepted => Ok(Json(PushResponse {
            accepted: true,
            reason: None,
            next_ping_ms: NEXT_PING_MS,
        })),
        PushOutcome::AcceptedNoMotion => Ok(Json(PushResponse {
            accepted: true,
            reason: Some("no_movement"),
            next_ping_ms: NEXT_PING_MS,
        })),
        PushOutcome::Throttled => Err(ApiError::Throttled {
            retry_after_ms: RETRY_AFTER_MS,
        }),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchPushRequest {
    pub updates: Vec<BatchLocationUpdate>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPushResponse {
    pub processed: usize,
    pub rejected: usize,
    pub rejected_ids: Vec<String>,
}

/// POST /api/vehicles/batch/locations
pub async fn push_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchPushRequest>,
) -> Result<Json<BatchPushResponse>, ApiError> {
    if body.updates.len() > MAX_BATCH {
        return Err(ApiError::Validation(vec![format!(
            "batch size {} exceeds maximum of {MAX_BATCH}",
            body.updates.len()
        )]));
    }

    let result = pipeline::push_batch(&state, body.updates).await?;
    Ok(Json(BatchPushResponse {
        processed: result.processed,
        rejected: result.rejected,
        rejected_ids: result.rejected_ids,
    }))
}
