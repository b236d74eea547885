use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A single GPS fix for one vehicle. The canonical shape for everything
/// that flows through the ingest pipeline, the cache, and the log bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub vehicle_id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub heading: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub altitude: f64,
    /// Epoch milliseconds, stamped at receive time when the device omits it.
    pub timestamp: i64,
}

/// Request body for a location push. The vehicle id comes from the URL
/// path (single push) or from the element itself (batch push).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLocationUpdate {
    #[serde(default)]
    pub vehicle_id: String,
    #[serde(flatten)]
    pub update: LocationUpdate,
}

impl LocationUpdate {
    /// Validate and convert into a `Position`. Returns every offending
    /// field at once so clients can fix their payload in one round trip.
    pub fn into_position(self, vehicle_id: &str, received_at: i64) -> Result<Position, Vec<String>> {
        let mut errors = Vec::new();

        if vehicle_id.trim().is_empty() {
            errors.push("vehicleId must be a non-empty string".to_string());
        }

        let lat = self.lat.unwrap_or_else(|| {
            errors.push("lat is required".to_string());
            0.0
        });
        let lng = self.lng.unwrap_or_else(|| {
            errors.push("lng is required".to_string());
            0.0
        });

        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            errors.push(format!("lat {} out of range [-90, 90]", lat));
        }
        if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
            errors.push(format!("lng {} out of range [-180, 180]", lng));
        }

        let speed = self.speed.unwrap_or(0.0);
        if !speed.is_finite() || speed < 0.0 {
            errors.push(format!("speed {} must be non-negative", speed));
        }

        let heading = self.heading.unwrap_or(0.0);
        if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
            errors.push(format!("heading {} out of range [0, 360)", heading));
        }

        let accuracy = self.accuracy.unwrap_or(0.0);
        if accuracy < 0.0 {
            errors.push(format!("accuracy {} must be non-negative", accuracy));
        }

        let altitude = self.altitude.unwrap_or(0.0);
        if altitude < 0.0 {
            errors.push(format!("altitude {} must be non-negative", altitude));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Position {
            vehicle_id: vehicle_id.to_string(),
            lat,
            lng,
            speed,
            heading,
            accuracy,
            altitude,
            timestamp: self.timestamp.unwrap_or(received_at),
        })
    }
}

/// Vehicle lifecycle status. Descriptor CRUD lives in an external service;
/// the core only flips status to `Active` as a side effect of ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Active,
    Inactive,
    Maintenance,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Active => "active",
            VehicleStatus::Inactive => "inactive",
            VehicleStatus::Maintenance => "maintenance",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => VehicleStatus::Active,
            "maintenance" => VehicleStatus::Maintenance,
            _ => VehicleStatus::Inactive,
        }
    }
}

/// The slice of the vehicle descriptor the core reads and updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleDescriptor {
    pub vehicle_id: String,
    pub owner_id: Option<String>,
    pub plate: Option<String>,
    pub kind: Option<String>,
    pub is_public: bool,
    pub status: VehicleStatus,
    /// Epoch milliseconds of the last accepted ping.
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardKind {
    Accident,
    Traffic,
    Construction,
    Pothole,
    Harassment,
    Flooding,
    Other,
}

impl HazardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HazardKind::Accident => "accident",
            HazardKind::Traffic => "traffic",
            HazardKind::Construction => "construction",
            HazardKind::Pothole => "pothole",
            HazardKind::Harassment => "harassment",
            HazardKind::Flooding => "flooding",
            HazardKind::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "accident" => Some(HazardKind::Accident),
            "traffic" => Some(HazardKind::Traffic),
            "construction" => Some(HazardKind::Construction),
            "pothole" => Some(HazardKind::Pothole),
            "harassment" => Some(HazardKind::Harassment),
            "flooding" => Some(HazardKind::Flooding),
            "other" => Some(HazardKind::Other),
            _ => None,
        }
    }
}

/// Geotagged road-hazard advisory. Opaque to the pipeline; the broker
/// fans it out to geographically-relevant subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HazardReport {
    pub id: String,
    pub kind: HazardKind,
    pub severity: u8,
    pub lat: f64,
    pub lng: f64,
    pub description: Option<String>,
    pub reported_by: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SosEvent {
    pub id: String,
    pub user_id: String,
    pub vehicle_id: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub message: Option<String>,
    pub created_at: i64,
}

/// Coalesced per-vehicle summary pushed to the global broadcast room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovedVehicle {
    pub vehicle_id: String,
    pub lat: f64,
    pub lng: f64,
    pub speed: f64,
    pub heading: f64,
}

impl From<&Position> for MovedVehicle {
    fn from(p: &Position) -> Self {
        Self {
            vehicle_id: p.vehicle_id.clone(),
            lat: p.lat,
            lng: p.lng,
            speed: p.speed,
            heading: p.heading,
        }
    }
}

/// One row of a nearby snapshot: the newest position within the window,
/// joined with the public subset of the vehicle descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyVehicle {
    pub vehicle_id: String,
    pub lat: f64,
    pub lng: f64,
    pub speed: f64,
    pub heading: f64,
    pub timestamp: i64,
    pub distance_km: f64,
    pub kind: Option<String>,
    pub status: VehicleStatus,
}

/// Server → client socket events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsServerEvent {
    #[serde(rename = "location")]
    Location(Position),
    #[serde(rename = "vehicle-moved")]
    VehicleMoved(Position),
    #[serde(rename = "batch-moved")]
    BatchMoved(Vec<MovedVehicle>),
    #[serde(rename = "status-changed")]
    StatusChanged {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
        status: VehicleStatus,
    },
    #[serde(rename = "new-hazard")]
    NewHazard(HazardReport),
    #[serde(rename = "sos-alert")]
    SosAlert(SosEvent),
    #[serde(rename = "route-alert")]
    RouteAlert(serde_json::Value),
    #[serde(rename = "nearby:snapshot")]
    NearbySnapshot(Vec<NearbyVehicle>),
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

/// Client → server socket messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsClientMessage {
    #[serde(rename = "subscribe:vehicle")]
    SubscribeVehicle {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
    },
    #[serde(rename = "unsubscribe:vehicle")]
    UnsubscribeVehicle {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
    },
    #[serde(rename = "subscribe:fleet")]
    SubscribeFleet {
        #[serde(rename = "fleetId")]
        fleet_id: String,
    },
    #[serde(rename = "push:location")]
    PushLocation(BatchLocationUpdate),
    #[serde(rename = "get:nearby")]
    GetNearby { lat: f64, lng: f64 },
    #[serde(rename = "ping")]
    Ping { timestamp: Option<i64> },
}

/// Application configuration, read once at boot.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: String,
    pub redis_url: Option<String>,
    pub event_bus_enabled: bool,
    pub jwt_secret: String,
    pub client_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "fleetpulse.db".to_string());

        let redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty());

        let event_bus_enabled = std::env::var("EVENT_BUS_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".to_string());

        let client_url = std::env::var("CLIENT_URL").ok().filter(|s| !s.trim().is_empty());

        Ok(Self {
            port,
            db_path,
            redis_url,
            event_bus_enabled,
            jwt_secret,
            client_url,
        })
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
