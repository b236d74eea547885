//! Log consumers.
//!
//! Every group drains the bus independently: the persistence worker bulk
//! writes history, the fan-out worker coalesces per vehicle and feeds the
//! broker, and the alert/event processors broadcast hazards, SOS signals,
//! and status flips. One task per group keeps each partition single-consumer
//! within its group.

pub mod fanout;
pub mod persistence;

use crate::state::AppState;

pub fn spawn_all(state: &AppState) {
    tokio::spawn(persistence::run(state.clone()));
    tokio::spawn(fanout::run_locations(state.clone()));
    tokio::spawn(fanout::run_alerts(state.clone()));
    tokio::spawn(fanout::run_events(state.clone()));
}
