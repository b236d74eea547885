//! Throttle / dead-zone gate.
//!
//! Runs in front of every single-record ingest. The throttle counter is
//! checked before the movement filter so a device cannot bypass
//! rate-limiting by reporting no motion. Cache failures degrade open:
//! throttling permits the request, the movement check accepts the ping.

use std::time::Duration;

use tracing::debug;

use crate::cache::LocationCache;

/// Maximum accepted pings per vehicle per window.
pub const R_MAX: u64 = 5;
/// Throttle window.
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(1);
/// Minimum movement in metres for a ping to count as motion.
pub const D_MIN_M: f64 = 10.0;
/// Backoff advised to throttled devices.
pub const RETRY_AFTER_MS: u64 = 1000;
/// Ping cadence advised to accepted devices.
pub const NEXT_PING_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Over the per-vehicle rate cap; advise `RETRY_AFTER_MS`.
    Throttled,
    /// Inside the dead zone; accepted but not forwarded downstream.
    NoMotion,
    /// Forward to cache, log, and fan-out.
    Forward,
}

pub async fn evaluate(cache: &dyn LocationCache, vehicle_id: &str, lat: f64, lng: f64) -> GateDecision {
    match cache.incr_throttle(vehicle_id, THROTTLE_WINDOW).await {
        Ok(n) if n > R_MAX => return GateDecision::Throttled,
        Ok(_) => {}
        Err(e) => {
            debug!(vehicle_id, error = %e, "throttle check failed, permitting request");
        }
    }

    match cache.has_moved(vehicle_id, lat, lng, D_MIN_M).await {
        Ok(true) => GateDecision::Forward,
        Ok(false) => GateDecision::NoMotion,
        Err(e) => {
            debug!(vehicle_id, error = %e, "movement check failed, accepting ping");
            GateDecision::Forward
        }
    }
}
