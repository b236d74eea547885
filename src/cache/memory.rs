//! Process-local cache fallback.
//!
//! Used when redis is not configured or unreachable. Same contract as the
//! remote cache, with per-entry expiry enforced locally.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{coalesce_newest, LocationCache, CACHE_TTL};
use crate::models::Position;

struct ThrottleEntry {
    count: u64,
    expires_at: Instant,
}

pub struct InMemoryCache {
    ttl: Duration,
    positions: RwLock<HashMap<String, (Position, Instant)>>,
    throttles: RwLock<HashMap<String, ThrottleEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::with_ttl(CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            positions: RwLock::new(HashMap::new()),
            throttles: RwLock::new(HashMap::new()),
        }
    }

    /// Drop expired entries. Called from a background sweeper.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.positions.write().retain(|_, (_, exp)| *exp > now);
        self.throttles.write().retain(|_, e| e.expires_at > now);
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationCache for InMemoryCache {
    async fn put(&self, pos: &Position) -> Result<()> {
        let now = Instant::now();
        let mut positions = self.positions.write();
        if let Some((prev, exp)) = positions.get(&pos.vehicle_id) {
            if *exp > now && prev.timestamp > pos.timestamp {
                return Ok(());
            }
        }
        positions.insert(pos.vehicle_id.clone(), (pos.clone(), now + self.ttl));
        Ok(())
    }

    async fn get(&self, vehicle_id: &str) -> Result<Option<Position>> {
        let positions = self.positions.read();
        Ok(positions
            .get(vehicle_id)
            .filter(|(_, exp)| *exp > Instant::now())
            .map(|(pos, _)| pos.clone()))
    }

    async fn put_batch(&self, batch: &[Position]) -> Result<()> {
        let now = Instant::now();
        let mut positions = self.positions.write();
        for pos in coalesce_newest(batch) {
            match positions.get(&pos.vehicle_id) {
                Some((prev, exp)) if *exp > now && prev.timestamp > pos.timestamp => {}
                _ => {
                    positions.insert(pos.vehicle_id.clone(), (pos.clone(), now + self.ttl));
                }
            }
        }
        Ok(())
    }

    async fn incr_throttle(&self, vehicle_id: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut throttles = self.throttles.write();
        let entry = throttles
            .entry(vehicle_id.to_string())
            .and_modify(|e| {
                if e.expires_at <= now {
                    e.count = 0;
                    e.expires_at = now + window;
                }
                e.count += 1;
            })
            .or_insert(ThrottleEntry {
                count: 1,
                expires_at: now + window,
            });
        Ok(entry.count)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
