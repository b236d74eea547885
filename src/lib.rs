//! FleetPulse backend library.
//!
//! Real-time fleet-telemetry ingestion and distribution: hot position
//! cache, throttle/dead-zone gate, partitioned event log, batched
//! persistence, and a room-based subscription broker.

pub mod api;
pub mod auth;
pub mod broker;
pub mod bus;
pub mod cache;
pub mod error;
pub mod gate;
pub mod geo;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod state;
pub mod store;
pub mod workers;
