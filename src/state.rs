//! Shared service registry.
//!
//! Everything with process lifetime is initialized once at boot in
//! dependency order (store → cache → bus → consumers → listener) and
//! handed to request handlers through this struct. No ambient globals.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::auth::JwtHandler;
use crate::broker::Broker;
use crate::bus::EventBus;
use crate::cache::LocationCache;
use crate::middleware::IpRateLimiter;
use crate::models::{now_millis, Config};
use crate::store::HistoryStore;

/// Liveness stamps for the consumer workers, surfaced by `/health`.
/// Zero means the worker has not completed a cycle yet.
#[derive(Default)]
pub struct ConsumerHeartbeats {
    pub db_writer: AtomicI64,
    pub fanout: AtomicI64,
    pub alerts: AtomicI64,
    pub events: AtomicI64,
}

impl ConsumerHeartbeats {
    pub fn beat(stamp: &AtomicI64) {
        stamp.store(now_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the worker's last heartbeat, if it ever beat.
    pub fn age_ms(stamp: &AtomicI64) -> Option<i64> {
        match stamp.load(Ordering::Relaxed) {
            0 => None,
            at => Some(now_millis() - at),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<HistoryStore>,
    pub cache: Arc<dyn LocationCache>,
    pub bus: Arc<EventBus>,
    pub broker: Arc<Broker>,
    pub jwt: Arc<JwtHandler>,
    pub heartbeats: Arc<ConsumerHeartbeats>,
    pub sos_limiter: IpRateLimiter,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<HistoryStore>,
        cache: Arc<dyn LocationCache>,
        bus: Arc<EventBus>,
        broker: Arc<Broker>,
        jwt: Arc<JwtHandler>,
        sos_limiter: IpRateLimiter,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            bus,
            broker,
            jwt,
            heartbeats: Arc::new(ConsumerHeartbeats::default()),
            sos_limiter,
        }
    }
}
