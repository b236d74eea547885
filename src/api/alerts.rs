//! Hazard-report and SOS submission.
//!
//! Reports are persisted with an expiry and ride the `route-alerts` topic
//! to every connected session. SOS is double-gated (per-user credits,
//! per-IP window) and rides `vehicle-events`; both fall back to an inline
//! broadcast when the log refuses the publish.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::auth::TokenError;
use crate::broker::{RoomPublisher, ROOM_NEARBY_ALL};
use crate::bus::{TOPIC_ALERTS, TOPIC_EVENTS};
use crate::error::{ApiError, CODE_SOS_CREDIT_EXHAUSTED, CODE_TOKEN_EXPIRED};
use crate::middleware::RateLimitResult;
use crate::models::{now_millis, HazardKind, HazardReport, SosEvent, WsServerEvent};
use crate::state::AppState;

/// Default hazard lifetime.
pub const REPORT_TTL_MS: i64 = 6 * 3600 * 1000;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSubmission {
    pub kind: String,
    pub severity: Option<u8>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub id: String,
    pub expires_at: i64,
}

/// POST /api/reports
pub async fn submit_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ReportSubmission>,
) -> Result<(StatusCode, Json<ReportResponse>), ApiError> {
    let mut errors = Vec::new();
    let kind = HazardKind::from_str(&body.kind).unwrap_or_else(|| {
        errors.push(format!("unknown report kind '{}'", body.kind));
        HazardKind::Other
    });
    let lat = body.lat.unwrap_or_else(|| {
        errors.push("lat is required".to_string());
        0.0
    });
    let lng = body.lng.unwrap_or_else(|| {
        errors.push("lng is required".to_string());
        0.0
    });
    if !(-90.0..=90.0).contains(&lat) {
        errors.push(format!("lat {lat} out of range [-90, 90]"));
    }
    if !(-180.0..=180.0).contains(&lng) {
        errors.push(format!("lng {lng} out of range [-180, 180]"));
    }
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    // Reports may be anonymous; a valid token attributes the submitter.
    let reported_by = bearer_token(&headers)
        .and_then(|token| state.jwt.validate_token(token).ok())
        .map(|claims| claims.sub);

    let now = now_millis();
    let report = HazardReport {
        id: Uuid::new_v4().to_string(),
        kind,
        severity: body.severity.unwrap_or(1).clamp(1, 5),
        lat,
        lng,
        description: body.description,
        reported_by,
        created_at: now,
        expires_at: now + REPORT_TTL_MS,
    };

    state.store.insert_report(&report)?;

    let payload = serde_json::to_value(&report).map_err(|e| ApiError::Internal(e.into()))?;
    if !state.bus.publish(TOPIC_ALERTS, "alert", payload).await {
        // Log unavailable: broadcast inline so connected clients still see it.
        state
            .broker
            .push_to_room(ROOM_NEARBY_ALL, WsServerEvent::NewHazard(report.clone()));
    }

    Ok((
        StatusCode::CREATED,
        Json(ReportResponse {
            id: report.id,
            expires_at: report.expires_at,
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SosSubmission {
    pub vehicle_id: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SosResponse {
    pub id: String,
    pub credits_remaining: i64,
}

/// POST /api/sos — authenticated, one-time emergency signal.
pub async fn submit_sos(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<SosSubmission>,
) -> Result<(StatusCode, Json<SosResponse>), ApiError> {
    let token = bearer_token(&headers).ok_or(ApiError::AuthRequired { code: None })?;
    let claims = state.jwt.validate_token(token).map_err(|e| match e {
        TokenError::Expired => ApiError::AuthRequired {
            code: Some(CODE_TOKEN_EXPIRED),
        },
        TokenError::Invalid => ApiError::AuthRequired { code: None },
    })?;

    let mut errors = Vec::new();
    let lat = body.lat.unwrap_or_else(|| {
        errors.push("lat is required".to_string());
        0.0
    });
    let lng = body.lng.unwrap_or_else(|| {
        errors.push("lng is required".to_string());
        0.0
    });
    if !(-90.0..=90.0).contains(&lat) {
        errors.push(format!("lat {lat} out of range [-90, 90]"));
    }
    if !(-180.0..=180.0).contains(&lng) {
        errors.push(format!("lng {lng} out of range [-180, 180]"));
    }
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let ip: IpAddr = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    if let RateLimitResult::Exceeded { retry_after } = state.sos_limiter.check(ip) {
        warn!(ip = %ip, retry_after_secs = retry_after.as_secs(), "sos ip limit hit");
        return Err(ApiError::Forbidden {
            code: Some(CODE_SOS_CREDIT_EXHAUSTED),
        });
    }

    let credits_remaining = state
        .store
        .take_sos_credit(&claims.sub)?
        .ok_or(ApiError::Forbidden {
            code: Some(CODE_SOS_CREDIT_EXHAUSTED),
        })?;

    let event = SosEvent {
        id: Uuid::new_v4().to_string(),
        user_id: claims.sub,
        vehicle_id: body.vehicle_id,
        lat,
        lng,
        message: body.message,
        created_at: now_millis(),
    };
    state.store.insert_sos(&event)?;

    let payload = serde_json::json!({
        "kind": "sos",
        "event": serde_json::to_value(&event).map_err(|e| ApiError::Internal(e.into()))?,
    });
    if !state.bus.publish(TOPIC_EVENTS, "sos", payload).await {
        state
            .broker
            .push_to_room(ROOM_NEARBY_ALL, WsServerEvent::SosAlert(event.clone()));
    }

    Ok((
        StatusCode::CREATED,
        Json(SosResponse {
            id: event.id,
            credits_remaining,
        }),
    ))
}
