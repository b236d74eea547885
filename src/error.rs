//! API error taxonomy.
//!
//! Every handler error maps to the wire envelope
//! `{ error, code?, details?, retryAfterMs? }` with a status that
//! reflects the kind.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug)]
pub enum ApiError {
    /// 400 with every offending field listed at once.
    Validation(Vec<String>),
    /// 401; `code` distinguishes expiry from an invalid credential.
    AuthRequired { code: Option<&'static str> },
    /// 403; `code` names the exhausted gate (e.g. SOS credits).
    Forbidden { code: Option<&'static str> },
    NotFound(String),
    /// 409, unique-constraint violation surfaced to the caller.
    Conflict(String),
    /// 429 from the ingest gate; carries the advised backoff.
    Throttled { retry_after_ms: u64 },
    Internal(anyhow::Error),
}

pub const CODE_TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
pub const CODE_SOS_CREDIT_EXHAUSTED: &str = "SOS_CREDIT_EXHAUSTED";
pub const CODE_THROTTLED: &str = "THROTTLED";

#[derive(Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<String>>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, envelope) = match self {
            ApiError::Validation(details) => (
                StatusCode::BAD_REQUEST,
                ErrorEnvelope {
                    error: "validation failed".to_string(),
                    code: None,
                    details: Some(details),
                    retry_after_ms: None,
                },
            ),
            ApiError::AuthRequired { code } => (
                StatusCode::UNAUTHORIZED,
                ErrorEnvelope {
                    error: "authentication required".to_string(),
                    code,
                    details: None,
                    retry_after_ms: None,
                },
            ),
            ApiError::Forbidden { code } => (
                StatusCode::FORBIDDEN,
                ErrorEnvelope {
                    error: "forbidden".to_string(),
                    code,
                    details: None,
                    retry_after_ms: None,
                },
            ),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ErrorEnvelope {
                    error: what,
                    code: None,
                    details: None,
                    retry_after_ms: None,
                },
            ),
            ApiError::Conflict(what) => (
                StatusCode::CONFLICT,
                ErrorEnvelope {
                    error: what,
                    code: None,
                    details: None,
                    retry_after_ms: None,
                },
            ),
            ApiError::Throttled { retry_after_ms } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorEnvelope {
                    error: "too many location updates".to_string(),
                    code: Some(CODE_THROTTLED),
                    details: None,
                    retry_after_ms: Some(retry_after_ms),
                },
            ),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorEnvelope {
                        error: "internal error".to_string(),
                        code: None,
                        details: None,
                        retry_after_ms: None,
                    },
                )
            }
        };

        (status, Json(envelope)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::Validation(vec![]).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::AuthRequired { code: None }.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Forbidden {
                code: Some(CODE_SOS_CREDIT_EXHAUSTED)
            }
            .into_response()
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::NotFound("vehicle".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Throttled { retry_after_ms: 1000 }
                .into_response()
                .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn envelope_omits_empty_fields() {
        let envelope = ErrorEnvelope {
            error: "nope".into(),
            code: None,
            details: None,
            retry_after_ms: None,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json, serde_json::json!({"error": "nope"}));
    }

    #[test]
    fn throttled_envelope_carries_retry_after() {
        let envelope = ErrorEnvelope {
            error: "too many location updates".into(),
            code: Some(CODE_THROTTLED),
            details: None,
            retry_after_ms: Some(1000),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["retryAfterMs"], 1000);
        assert_eq!(json["code"], "THROTTLED");
    }
}
