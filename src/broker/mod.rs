//! Subscription broker.
//!
//! Long-lived socket sessions grouped into rooms. Delivery is best-effort:
//! each session owns a bounded queue and slow consumers drop messages
//! rather than stalling publishers. The fan-out workers see only the
//! `RoomPublisher` capability, not the broker itself.

pub mod session;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::models::WsServerEvent;

/// Global broadcast room every session joins on connect.
pub const ROOM_NEARBY_ALL: &str = "nearby-all";

/// Outbound queue depth per session; overflow drops the message.
pub const SESSION_BUFFER: usize = 256;

pub const PING_INTERVAL: Duration = Duration::from_secs(10);
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(20);
pub const ROOM_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub fn vehicle_room(vehicle_id: &str) -> String {
    format!("vehicle:{vehicle_id}")
}

pub fn fleet_room(fleet_id: &str) -> String {
    format!("fleet:{fleet_id}")
}

/// The one capability the fan-out workers need from the broker.
pub trait RoomPublisher: Send + Sync {
    fn push_to_room(&self, room: &str, event: WsServerEvent);
}

struct SessionHandle {
    tx: mpsc::Sender<WsServerEvent>,
    rooms: HashSet<String>,
}

#[derive(Default)]
pub struct Broker {
    sessions: RwLock<HashMap<u64, SessionHandle>>,
    rooms: RwLock<HashMap<String, HashSet<u64>>>,
    next_session_id: AtomicU64,
    dropped_messages: AtomicU64,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and auto-join the global broadcast room. Returns
    /// the session id and the receiving half of its outbound queue.
    pub fn register(&self) -> (u64, mpsc::Receiver<WsServerEvent>) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        self.sessions.write().insert(
            id,
            SessionHandle {
                tx,
                rooms: HashSet::new(),
            },
        );
        self.join(id, ROOM_NEARBY_ALL);
        (id, rx)
    }

    /// Remove the session and vacate every room it holds.
    pub fn disconnect(&self, session_id: u64) {
        let Some(handle) = self.sessions.write().remove(&session_id) else {
            return;
        };
        let mut rooms = self.rooms.write();
        for room in handle.rooms {
            if let Some(members) = rooms.get_mut(&room) {
                members.remove(&session_id);
            }
        }
        debug!(session_id, "session disconnected");
    }

    pub fn join(&self, session_id: u64, room: &str) {
        let mut sessions = self.sessions.write();
        let Some(handle) = sessions.get_mut(&session_id) else {
            return;
        };
        handle.rooms.insert(room.to_string());
        self.rooms
            .write()
            .entry(room.to_string())
            .or_default()
            .insert(session_id);
    }

    pub fn leave(&self, session_id: u64, room: &str) {
        if let Some(handle) = self.sessions.write().get_mut(&session_id) {
            handle.rooms.remove(room);
        }
        if let Some(members) = self.rooms.write().get_mut(room) {
            members.remove(&session_id);
        }
    }

    /// Direct delivery to one session (on-subscribe snapshots, errors).
    pub fn send_to_session(&self, session_id: u64, event: WsServerEvent) -> bool {
        let sessions = self.sessions.read();
        match sessions.get(&session_id) {
            Some(handle) => match handle.tx.try_send(event) {
                Ok(()) => true,
                Err(_) => {
                    self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Reclaim empty room structures. Run every `ROOM_SWEEP_INTERVAL`.
    pub fn sweep_empty_rooms(&self) -> usize {
        let mut rooms = self.rooms.write();
        let before = rooms.len();
        rooms.retain(|_, members| !members.is_empty());
        before - rooms.len()
    }
}

impl RoomPublisher for Broker {
    fn push_to_room(&self, room: &str, event: WsServerEvent) {
        let targets: Vec<u64> = {
            let rooms = self.rooms.read();
            match rooms.get(room) {
                Some(members) => members.iter().copied().collect(),
                None => return,
            }
        };

        let mut dead: Vec<u64> = Vec::new();
        {
            let sessions = self.sessions.read();
            for id in targets {
                let Some(handle) = sessions.get(&id) else {
                    continue;
                };
                match handle.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow consumer: drop instead of stalling the publisher.
                        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                        trace!(session_id = id, room, "dropped message for slow consumer");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
                }
            }
        }

        for id in dead {
            self.disconnect(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Position;

    fn event(ts: i64) -> WsServerEvent {
        WsServerEvent::VehicleMoved(Position {
            vehicle_id: "veh_1".into(),
            lat: 0.0,
            lng: 0.0,
            speed: 0.0,
            heading: 0.0,
            accuracy: 0.0,
            altitude: 0.0,
            timestamp: ts,
        })
    }

    #[tokio::test]
    async fn sessions_auto_join_global_room() {
        let broker = Broker::new();
        let (_id, mut rx) = broker.register();
        broker.push_to_room(ROOM_NEARBY_ALL, event(1));
        assert!(matches!(rx.recv().await, Some(WsServerEvent::VehicleMoved(_))));
    }

    #[tokio::test]
    async fn room_delivery_reaches_only_members() {
        let broker = Broker::new();
        let (a, mut rx_a) = broker.register();
        let (_b, mut rx_b) = broker.register();

        broker.join(a, &vehicle_room("veh_1"));
        broker.push_to_room(&vehicle_room("veh_1"), event(1));

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_stops_delivery() {
        let broker = Broker::new();
        let (a, mut rx) = broker.register();
        broker.join(a, &vehicle_room("veh_1"));
        broker.leave(a, &vehicle_room("veh_1"));
        broker.push_to_room(&vehicle_room("veh_1"), event(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_vacates_all_rooms() {
        let broker = Broker::new();
        let (a, _rx) = broker.register();
        broker.join(a, &vehicle_room("veh_1"));
        broker.join(a, &fleet_room("fleet_9"));

        broker.disconnect(a);
        assert_eq!(broker.session_count(), 0);

        // Membership sets are empty; sweeper reclaims the structures.
        let reclaimed = broker.sweep_empty_rooms();
        assert_eq!(reclaimed, 3);
        assert_eq!(broker.room_count(), 0);
    }

    #[tokio::test]
    async fn slow_consumer_drops_instead_of_blocking() {
        let broker = Broker::new();
        let (_a, mut rx) = broker.register();

        for i in 0..(SESSION_BUFFER + 10) {
            broker.push_to_room(ROOM_NEARBY_ALL, event(i as i64));
        }
        assert_eq!(broker.dropped_messages(), 10);

        // The buffered prefix is still delivered in order.
        let first = rx.recv().await.unwrap();
        match first {
            WsServerEvent::VehicleMoved(p) => assert_eq!(p.timestamp, 0),
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test]
    async fn closed_session_is_reaped_on_push() {
        let broker = Broker::new();
        let (_a, rx) = broker.register();
        drop(rx);
        broker.push_to_room(ROOM_NEARBY_ALL, event(1));
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn push_to_unknown_room_is_a_noop() {
        let broker = Broker::new();
        broker.push_to_room("vehicle:ghost", event(1));
    }
}
