//! Hot position cache.
//!
//! Keyed store `loc:{vehicle_id}` holding the last-known position of each
//! vehicle with a bounded TTL, plus the per-vehicle throttle counters used
//! by the ingest gate. One capability trait, two implementations: a remote
//! redis cache and a process-local fallback selected at boot when redis is
//! not configured or unreachable.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::geo::planar_distance_m;
use crate::models::{Config, Position};

/// How long a cache entry stays observable after the last write.
pub const CACHE_TTL: Duration = Duration::from_secs(300);

/// Capability surface shared by the remote cache and the in-process
/// fallback. Any operation may fail; callers decide the degradation
/// (fail-open for throttling, fail-true for movement checks, fail-silent
/// for writes).
#[async_trait]
pub trait LocationCache: Send + Sync {
    /// Store `pos` with the standard TTL. A stored entry with a newer
    /// timestamp for the same vehicle is never overwritten.
    async fn put(&self, pos: &Position) -> Result<()>;

    async fn get(&self, vehicle_id: &str) -> Result<Option<Position>>;

    /// Store many positions in a bounded number of round trips. Entries
    /// for the same vehicle are coalesced to the newest timestamp before
    /// writing.
    async fn put_batch(&self, positions: &[Position]) -> Result<()>;

    /// Atomically increment the per-vehicle throttle counter; the first
    /// write in a window sets the TTL to `window`.
    async fn incr_throttle(&self, vehicle_id: &str, window: Duration) -> Result<u64>;

    /// Whether the vehicle has moved at least `min_m` metres from its
    /// cached position. True when no prior entry exists.
    async fn has_moved(&self, vehicle_id: &str, lat: f64, lng: f64, min_m: f64) -> Result<bool> {
        match self.get(vehicle_id).await? {
            None => Ok(true),
            Some(prev) => Ok(planar_distance_m(prev.lat, prev.lng, lat, lng) >= min_m),
        }
    }

    fn backend(&self) -> &'static str;
}

pub(crate) fn location_key(vehicle_id: &str) -> String {
    format!("loc:{vehicle_id}")
}

pub(crate) fn throttle_key(vehicle_id: &str) -> String {
    format!("thr:{vehicle_id}")
}

/// Coalesce a batch to one entry per vehicle, keeping the newest timestamp.
pub(crate) fn coalesce_newest(positions: &[Position]) -> Vec<&Position> {
    let mut newest: std::collections::HashMap<&str, &Position> = std::collections::HashMap::new();
    for pos in positions {
        newest
            .entry(pos.vehicle_id.as_str())
            .and_modify(|cur| {
                if pos.timestamp >= cur.timestamp {
                    *cur = pos;
                }
            })
            .or_insert(pos);
    }
    newest.into_values().collect()
}

/// Select the cache backend at boot: redis when configured and reachable,
/// otherwise the in-process fallback with the same contract. The fallback
/// gets a background sweeper for its TTL expiry.
pub async fn connect(config: &Config) -> Arc<dyn LocationCache> {
    if let Some(url) = &config.redis_url {
        match redis::RedisCache::connect(url).await {
            Ok(cache) => {
                info!(url = %url, "redis hot cache connected");
                return Arc::new(cache);
            }
            Err(e) => {
                warn!(error = %e, "redis unreachable, falling back to in-memory cache");
            }
        }
    } else {
        info!("REDIS_URL not set, using in-memory hot cache");
    }

    let cache = Arc::new(memory::InMemoryCache::new());
    let sweeper = cache.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            sweeper.cleanup();
        }
    });
    cache
}
