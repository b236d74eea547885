//! History store.
//!
//! Positional history, vehicle descriptors, hazard reports, and SOS state
//! on sqlite. WAL mode keeps reads concurrent with the bulk writers; the
//! `(vehicle_id, ts)` primary key makes at-least-once replays idempotent
//! (duplicate inserts are ignored).

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::geo::{degrees_for_km, planar_distance_km};
use crate::models::{
    HazardReport, NearbyVehicle, Position, SosEvent, VehicleDescriptor, VehicleStatus,
};

/// Positions older than this are reclaimable.
pub const HISTORY_RETENTION_MS: i64 = 30 * 24 * 3600 * 1000;
/// Default per-user one-time-emergency budget.
pub const SOS_DEFAULT_CREDITS: i64 = 3;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS positions (
    vehicle_id TEXT NOT NULL,
    ts INTEGER NOT NULL,
    lat REAL NOT NULL,
    lng REAL NOT NULL,
    speed REAL NOT NULL DEFAULT 0,
    heading REAL NOT NULL DEFAULT 0,
    accuracy REAL NOT NULL DEFAULT 0,
    altitude REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (vehicle_id, ts)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_positions_ts ON positions(ts);

CREATE TABLE IF NOT EXISTS vehicles (
    vehicle_id TEXT PRIMARY KEY,
    owner_id TEXT,
    plate TEXT UNIQUE,
    kind TEXT,
    is_public INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'inactive',
    last_seen INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_vehicles_owner ON vehicles(owner_id);
CREATE INDEX IF NOT EXISTS idx_vehicles_public ON vehicles(is_public, kind, status);

CREATE TABLE IF NOT EXISTS route_reports (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    severity INTEGER NOT NULL,
    lat REAL NOT NULL,
    lng REAL NOT NULL,
    description TEXT,
    reported_by TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_route_reports_geo ON route_reports(lat, lng);
CREATE INDEX IF NOT EXISTS idx_route_reports_expiry ON route_reports(expires_at);

CREATE TABLE IF NOT EXISTS sos_events (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    vehicle_id TEXT,
    lat REAL NOT NULL,
    lng REAL NOT NULL,
    message TEXT,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS sos_credits (
    user_id TEXT PRIMARY KEY,
    credits INTEGER NOT NULL
) WITHOUT ROWID;
"#;

pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !matches!(journal_mode.to_lowercase().as_str(), "wal" | "memory") {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!(path = db_path, "history store initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn ping(&self) -> bool {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    // --- positions -------------------------------------------------------

    pub fn insert_position(&self, pos: &Position) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO positions
             (vehicle_id, ts, lat, lng, speed, heading, accuracy, altitude)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                pos.vehicle_id,
                pos.timestamp,
                pos.lat,
                pos.lng,
                pos.speed,
                pos.heading,
                pos.accuracy,
                pos.altitude,
            ],
        )?;
        Ok(())
    }

    /// Unordered bulk insert; duplicates are skipped, partial success is
    /// fine. Returns the number of rows actually written.
    pub fn insert_positions(&self, batch: &[Position]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO positions
                 (vehicle_id, ts, lat, lng, speed, heading, accuracy, altitude)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for pos in batch {
                written += stmt.execute(params![
                    pos.vehicle_id,
                    pos.timestamp,
                    pos.lat,
                    pos.lng,
                    pos.speed,
                    pos.heading,
                    pos.accuracy,
                    pos.altitude,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn latest_position(&self, vehicle_id: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT vehicle_id, ts, lat, lng, speed, heading, accuracy, altitude
             FROM positions WHERE vehicle_id = ?1 ORDER BY ts DESC LIMIT 1",
        )?;
        let result = stmt.query_row(params![vehicle_id], row_to_position);
        match result {
            Ok(pos) => Ok(Some(pos)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reverse-chronological page of a vehicle's history.
    pub fn history(
        &self,
        vehicle_id: &str,
        from: Option<i64>,
        to: Option<i64>,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Position>> {
        let page = page.max(1);
        let offset = (page - 1) as i64 * limit as i64;
        let from = from.unwrap_or(i64::MIN);
        let to = to.unwrap_or(i64::MAX);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT vehicle_id, ts, lat, lng, speed, heading, accuracy, altitude
             FROM positions
             WHERE vehicle_id = ?1 AND ts >= ?2 AND ts <= ?3
             ORDER BY ts DESC LIMIT ?4 OFFSET ?5",
        )?;
        let rows = stmt.query_map(
            params![vehicle_id, from, to, limit as i64, offset],
            row_to_position,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Newest position per vehicle within the window, joined with the
    /// public descriptor subset, filtered to the radius, nearest first.
    pub fn nearby(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        window_start_ms: i64,
        cap: usize,
    ) -> Result<Vec<NearbyVehicle>> {
        let half = degrees_for_km(radius_km);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT p.vehicle_id, p.ts, p.lat, p.lng, p.speed, p.heading, v.kind, v.status
             FROM positions p
             JOIN (SELECT vehicle_id, MAX(ts) AS mt FROM positions WHERE ts >= ?1 GROUP BY vehicle_id) m
               ON p.vehicle_id = m.vehicle_id AND p.ts = m.mt
             JOIN vehicles v ON v.vehicle_id = p.vehicle_id AND v.is_public = 1
             WHERE p.lat BETWEEN ?2 AND ?3 AND p.lng BETWEEN ?4 AND ?5",
        )?;
        let rows = stmt.query_map(
            params![window_start_ms, lat - half, lat + half, lng - half, lng + half],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )?;

        let mut nearby = Vec::new();
        for row in rows {
            let (vehicle_id, ts, vlat, vlng, speed, heading, kind, status) = row?;
            let distance_km = planar_distance_km(lat, lng, vlat, vlng);
            if distance_km <= radius_km {
                nearby.push(NearbyVehicle {
                    vehicle_id,
                    lat: vlat,
                    lng: vlng,
                    speed,
                    heading,
                    timestamp: ts,
                    distance_km,
                    kind,
                    status: VehicleStatus::from_str(&status),
                });
            }
        }
        nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        nearby.truncate(cap);
        Ok(nearby)
    }

    pub fn prune_positions_before(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM positions WHERE ts < ?1", params![cutoff_ms])?;
        Ok(deleted)
    }

    // --- vehicles --------------------------------------------------------

    /// Flip descriptors to `active` and stamp `last_seen` for every id in
    /// the batch, creating rows for vehicles the metadata service has not
    /// registered yet. Returns the ids whose status actually changed.
    pub fn mark_vehicles_active(&self, ids: &[String], now_ms: i64) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let placeholders = vec!["?"; ids.len()].join(",");
        let already_active: HashSet<String> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT vehicle_id FROM vehicles WHERE vehicle_id IN ({placeholders}) AND status = 'active'"
            ))?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<HashSet<_>, _>>()?
        };

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO vehicles (vehicle_id, status, last_seen) VALUES (?1, 'active', ?2)
                 ON CONFLICT(vehicle_id) DO UPDATE SET status = 'active', last_seen = excluded.last_seen",
            )?;
            for id in ids {
                stmt.execute(params![id, now_ms])?;
            }
        }
        tx.commit()?;

        Ok(ids
            .iter()
            .filter(|id| !already_active.contains(*id))
            .cloned()
            .collect())
    }

    pub fn get_vehicle(&self, vehicle_id: &str) -> Result<Option<VehicleDescriptor>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT vehicle_id, owner_id, plate, kind, is_public, status, last_seen
             FROM vehicles WHERE vehicle_id = ?1",
        )?;
        let result = stmt.query_row(params![vehicle_id], |row| {
            Ok(VehicleDescriptor {
                vehicle_id: row.get(0)?,
                owner_id: row.get(1)?,
                plate: row.get(2)?,
                kind: row.get(3)?,
                is_public: row.get::<_, i64>(4)? != 0,
                status: VehicleStatus::from_str(&row.get::<_, String>(5)?),
                last_seen: row.get(6)?,
            })
        });
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Descriptor upsert on behalf of the external metadata service; the
    /// core itself only ever calls `mark_vehicles_active`.
    pub fn upsert_vehicle(&self, v: &VehicleDescriptor) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO vehicles (vehicle_id, owner_id, plate, kind, is_public, status, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(vehicle_id) DO UPDATE SET
               owner_id = excluded.owner_id, plate = excluded.plate, kind = excluded.kind,
               is_public = excluded.is_public, status = excluded.status, last_seen = excluded.last_seen",
            params![
                v.vehicle_id,
                v.owner_id,
                v.plate,
                v.kind,
                v.is_public as i64,
                v.status.as_str(),
                v.last_seen,
            ],
        )?;
        Ok(())
    }

    // --- hazard reports ---------------------------------------------------

    pub fn insert_report(&self, report: &HazardReport) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO route_reports
             (id, kind, severity, lat, lng, description, reported_by, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                report.id,
                report.kind.as_str(),
                report.severity as i64,
                report.lat,
                report.lng,
                report.description,
                report.reported_by,
                report.created_at,
                report.expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn prune_expired_reports(&self, now_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM route_reports WHERE expires_at < ?1",
            params![now_ms],
        )?;
        Ok(deleted)
    }

    // --- sos ---------------------------------------------------------------

    pub fn insert_sos(&self, event: &SosEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sos_events (id, user_id, vehicle_id, lat, lng, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id,
                event.user_id,
                event.vehicle_id,
                event.lat,
                event.lng,
                event.message,
                event.created_at,
            ],
        )?;
        Ok(())
    }

    /// Atomically take one SOS credit. Returns the remaining balance, or
    /// `None` when the budget is exhausted.
    pub fn take_sos_credit(&self, user_id: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO sos_credits (user_id, credits) VALUES (?1, ?2)",
            params![user_id, SOS_DEFAULT_CREDITS],
        )?;
        let taken = tx.execute(
            "UPDATE sos_credits SET credits = credits - 1 WHERE user_id = ?1 AND credits > 0",
            params![user_id],
        )?;
        let remaining = if taken == 1 {
            let left: i64 = tx.query_row(
                "SELECT credits FROM sos_credits WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            Some(left)
        } else {
            None
        };
        tx.commit()?;
        Ok(remaining)
    }

    pub fn prune_sos_before(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sos_events WHERE created_at < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    pub fn optimize(&self) -> Result<()> {
        self.conn.lock().execute_batch("PRAGMA optimize;")?;
        Ok(())
    }
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        vehicle_id: row.get(0)?,
        timestamp: row.get(1)?,
        lat: row.get(2)?,
        lng: row.get(3)?,
        speed: row.get(4)?,
        heading: row.get(5)?,
        accuracy: row.get(6)?,
        altitude: row.get(7)?,
    })
}
