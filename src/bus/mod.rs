//! In-process partitioned event log.
//!
//! Three topics carry everything that leaves the ingest path: location
//! fan-in, vehicle events, and hazard broadcasts. Records are keyed;
//! a key lands on one partition, so a single vehicle's stream is totally
//! ordered. Consumers join named groups, fetch per-partition batches
//! bounded by a byte budget, and advance offsets explicitly — records
//! fetched but never committed are redelivered, giving at-least-once
//! semantics across consumer restarts.
//!
//! Publishing is bounded: a partition whose buffer is saturated (consumer
//! lagging far behind) rejects the append, and the publish wrapper retries
//! with capped exponential backoff before reporting failure. Callers fall
//! through to the direct-write path on `false`.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::models::now_millis;

pub const TOPIC_LOCATIONS: &str = "vehicle-locations";
pub const TOPIC_EVENTS: &str = "vehicle-events";
pub const TOPIC_ALERTS: &str = "route-alerts";

pub const GROUP_DB_WRITER: &str = "location-db-writer";
pub const GROUP_FANOUT: &str = "websocket-fanout";
pub const GROUP_ALERTS: &str = "alert-processor";
pub const GROUP_EVENTS: &str = "event-processor";

/// Per-partition fetch budget.
pub const FETCH_BYTE_BUDGET: usize = 1 << 20;

const PUBLISH_RETRY_MAX: u32 = 8;
const PUBLISH_BACKOFF_BASE_MS: u64 = 25;
const PUBLISH_BACKOFF_CAP_MS: u64 = 2_000;

/// How long a consumer sleeps when no publish wakes it first.
const WAIT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub name: &'static str,
    pub partitions: usize,
    pub retention: Duration,
    /// Per-partition buffer cap; appends beyond it are rejected.
    pub max_buffered: usize,
}

pub fn standard_topics() -> Vec<TopicConfig> {
    vec![
        TopicConfig {
            name: TOPIC_LOCATIONS,
            partitions: 32,
            retention: Duration::from_secs(24 * 3600),
            max_buffered: 16_384,
        },
        TopicConfig {
            name: TOPIC_EVENTS,
            partitions: 8,
            retention: Duration::from_secs(7 * 24 * 3600),
            max_buffered: 16_384,
        },
        TopicConfig {
            name: TOPIC_ALERTS,
            partitions: 4,
            retention: Duration::from_secs(6 * 3600),
            max_buffered: 16_384,
        },
    ]
}

#[derive(Debug, Clone)]
pub struct Record {
    pub offset: u64,
    pub key: String,
    pub payload: Value,
    /// Epoch milliseconds at append time; drives retention.
    pub published_at: i64,
    pub approx_bytes: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum PublishError {
    Disabled,
    UnknownTopic,
    Saturated,
}

#[derive(Default)]
struct PartitionInner {
    records: VecDeque<Record>,
    next_offset: u64,
    /// Next offset each group will read.
    committed: HashMap<String, u64>,
}

impl PartitionInner {
    fn base_offset(&self) -> u64 {
        self.records.front().map(|r| r.offset).unwrap_or(self.next_offset)
    }
}

struct Topic {
    config: TopicConfig,
    partitions: Vec<Mutex<PartitionInner>>,
    data_ready: Notify,
}

pub struct EventBus {
    topics: HashMap<&'static str, Topic>,
    enabled: AtomicBool,
}

impl EventBus {
    pub fn new(enabled: bool) -> Self {
        Self::with_topics(standard_topics(), enabled)
    }

    pub fn with_topics(configs: Vec<TopicConfig>, enabled: bool) -> Self {
        let topics = configs
            .into_iter()
            .map(|config| {
                let partitions = (0..config.partitions)
                    .map(|_| Mutex::new(PartitionInner::default()))
                    .collect();
                (
                    config.name,
                    Topic {
                        config,
                        partitions,
                        data_ready: Notify::new(),
                    },
                )
            })
            .collect();

        Self {
            topics,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn partition_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|t| t.config.partitions).unwrap_or(0)
    }

    /// Stable key → partition mapping; a vehicle's records always land on
    /// the same partition.
    pub fn partition_for(&self, topic: &str, key: &str) -> Option<usize> {
        let topic = self.topics.get(topic)?;
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Some((hasher.finish() % topic.config.partitions as u64) as usize)
    }

    fn try_publish(&self, topic_name: &str, entries: &[(String, Value)]) -> Result<(), PublishError> {
        if !self.is_enabled() {
            return Err(PublishError::Disabled);
        }
        let topic = self.topics.get(topic_name).ok_or(PublishError::UnknownTopic)?;

        let mut by_partition: BTreeMap<usize, Vec<&(String, Value)>> = BTreeMap::new();
        for entry in entries {
            let partition = self
                .partition_for(topic_name, &entry.0)
                .expect("topic exists");
            by_partition.entry(partition).or_default().push(entry);
        }

        // Lock target partitions in ascending order so a multi-record send
        // is all-or-nothing against the capacity check.
        let mut guards: Vec<(usize, parking_lot::MutexGuard<'_, PartitionInner>)> = by_partition
            .keys()
            .map(|&i| (i, topic.partitions[i].lock()))
            .collect();

        for (i, guard) in &guards {
            if guard.records.len() + by_partition[i].len() > topic.config.max_buffered {
                return Err(PublishError::Saturated);
            }
        }

        let now = now_millis();
        let horizon = now - topic.config.retention.as_millis() as i64;
        for (i, guard) in guards.iter_mut() {
            for (key, payload) in by_partition[&*i].iter().map(|e| (&e.0, &e.1)) {
                let approx_bytes = serde_json::to_string(payload).map(|s| s.len()).unwrap_or(0);
                let offset = guard.next_offset;
                guard.next_offset += 1;
                guard.records.push_back(Record {
                    offset,
                    key: key.clone(),
                    payload: payload.clone(),
                    published_at: now,
                    approx_bytes,
                });
            }
            while guard.records.front().is_some_and(|r| r.published_at < horizon) {
                guard.records.pop_front();
            }
        }
        drop(guards);

        topic.data_ready.notify_waiters();
        Ok(())
    }

    /// Publish one record; retries saturation with capped backoff, then
    /// reports `false` so the caller can take the direct-write path.
    pub async fn publish(&self, topic: &str, key: &str, payload: Value) -> bool {
        self.publish_batch(topic, vec![(key.to_string(), payload)]).await
    }

    /// Multi-record send; atomic per call but not across calls.
    pub async fn publish_batch(&self, topic: &str, entries: Vec<(String, Value)>) -> bool {
        if entries.is_empty() {
            return true;
        }
        let mut backoff = PUBLISH_BACKOFF_BASE_MS;
        for attempt in 1..=PUBLISH_RETRY_MAX {
            match self.try_publish(topic, &entries) {
                Ok(()) => return true,
                Err(PublishError::Disabled) => return false,
                Err(PublishError::UnknownTopic) => {
                    warn!(topic, "publish to unknown topic dropped");
                    return false;
                }
                Err(PublishError::Saturated) => {
                    debug!(topic, attempt, backoff_ms = backoff, "partition saturated, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(PUBLISH_BACKOFF_CAP_MS);
                }
            }
        }
        warn!(topic, "publish gave up after {PUBLISH_RETRY_MAX} attempts");
        false
    }

    /// Fetch a batch from one partition for a consumer group, starting at
    /// the group's committed offset and bounded by `max_bytes` (always at
    /// least one record when any is available).
    pub fn fetch(&self, topic: &str, group: &str, partition: usize, max_bytes: usize) -> Vec<Record> {
        let Some(topic) = self.topics.get(topic) else {
            return Vec::new();
        };
        let Some(part) = topic.partitions.get(partition) else {
            return Vec::new();
        };

        let inner = part.lock();
        let start = inner
            .committed
            .get(group)
            .copied()
            .unwrap_or(0)
            .max(inner.base_offset());

        let mut batch = Vec::new();
        let mut bytes = 0usize;
        for record in inner.records.iter().skip_while(|r| r.offset < start) {
            if !batch.is_empty() && bytes + record.approx_bytes > max_bytes {
                break;
            }
            bytes += record.approx_bytes;
            batch.push(record.clone());
        }
        batch
    }

    /// Advance the group's committed offset on one partition. `next` is
    /// the offset after the last processed record.
    pub fn commit(&self, topic: &str, group: &str, partition: usize, next: u64) {
        if let Some(topic) = self.topics.get(topic) {
            if let Some(part) = topic.partitions.get(partition) {
                let mut inner = part.lock();
                let entry = inner.committed.entry(group.to_string()).or_insert(0);
                *entry = (*entry).max(next);
            }
        }
    }

    /// Park until a publish lands on the topic, or the poll interval
    /// elapses. The interval bounds the delay from a wakeup lost to the
    /// check-then-wait race.
    pub async fn wait_for_records(&self, topic: &str) {
        if let Some(topic) = self.topics.get(topic) {
            let _ = tokio::time::timeout(WAIT_POLL, topic.data_ready.notified()).await;
        } else {
            tokio::time::sleep(WAIT_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_bus() -> EventBus {
        EventBus::with_topics(
            vec![TopicConfig {
                name: "test-topic",
                partitions: 4,
                retention: Duration::from_secs(3600),
                max_buffered: 8,
            }],
            true,
        )
    }

    #[tokio::test]
    async fn same_key_always_lands_on_same_partition() {
        let bus = small_bus();
        let first = bus.partition_for("test-topic", "veh_1").unwrap();
        for _ in 0..10 {
            assert_eq!(bus.partition_for("test-topic", "veh_1").unwrap(), first);
        }
    }

    #[tokio::test]
    async fn per_key_order_is_preserved() {
        let bus = small_bus();
        for i in 0..5 {
            assert!(bus.publish("test-topic", "veh_1", json!({"seq": i})).await);
        }
        let partition = bus.partition_for("test-topic", "veh_1").unwrap();
        let batch = bus.fetch("test-topic", "group-a", partition, FETCH_BYTE_BUDGET);
        let seqs: Vec<i64> = batch.iter().map(|r| r.payload["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn groups_consume_independently() {
        let bus = small_bus();
        bus.publish("test-topic", "veh_1", json!({"n": 1})).await;
        let partition = bus.partition_for("test-topic", "veh_1").unwrap();

        let a = bus.fetch("test-topic", "group-a", partition, FETCH_BYTE_BUDGET);
        bus.commit("test-topic", "group-a", partition, a.last().unwrap().offset + 1);

        // group-b still sees the record after group-a committed past it.
        let b = bus.fetch("test-topic", "group-b", partition, FETCH_BYTE_BUDGET);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn uncommitted_records_are_redelivered() {
        let bus = small_bus();
        bus.publish("test-topic", "veh_1", json!({"n": 1})).await;
        let partition = bus.partition_for("test-topic", "veh_1").unwrap();

        let first = bus.fetch("test-topic", "group-a", partition, FETCH_BYTE_BUDGET);
        let second = bus.fetch("test-topic", "group-a", partition, FETCH_BYTE_BUDGET);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].offset, second[0].offset);

        bus.commit("test-topic", "group-a", partition, first[0].offset + 1);
        assert!(bus.fetch("test-topic", "group-a", partition, FETCH_BYTE_BUDGET).is_empty());
    }

    #[tokio::test]
    async fn fetch_respects_byte_budget_but_returns_at_least_one() {
        let bus = small_bus();
        let big = "x".repeat(512);
        for _ in 0..4 {
            bus.publish("test-topic", "veh_1", json!({"blob": big})).await;
        }
        let partition = bus.partition_for("test-topic", "veh_1").unwrap();

        let batch = bus.fetch("test-topic", "group-a", partition, 600);
        assert_eq!(batch.len(), 1);

        let batch = bus.fetch("test-topic", "group-a", partition, 10);
        assert_eq!(batch.len(), 1, "budget smaller than a record still yields one");
    }

    #[tokio::test]
    async fn disabled_bus_rejects_publishes() {
        let bus = small_bus();
        bus.set_enabled(false);
        assert!(!bus.publish("test-topic", "veh_1", json!({})).await);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_partition_fails_after_retry_budget() {
        let bus = small_bus();
        for i in 0..8 {
            assert!(bus.publish("test-topic", "veh_1", json!({"n": i})).await);
        }
        // Partition buffer is full and nobody consumes; the publish burns
        // its retry budget and reports failure.
        assert!(!bus.publish("test-topic", "veh_1", json!({"n": 9})).await);
    }

    #[tokio::test]
    async fn batch_publish_is_all_or_nothing_per_call() {
        let bus = small_bus();
        let entries: Vec<(String, Value)> =
            (0..5).map(|i| ("veh_1".to_string(), json!({"n": i}))).collect();
        assert!(bus.publish_batch("test-topic", entries).await);

        let partition = bus.partition_for("test-topic", "veh_1").unwrap();
        let batch = bus.fetch("test-topic", "group-a", partition, FETCH_BYTE_BUDGET);
        assert_eq!(batch.len(), 5);
    }

    #[tokio::test]
    async fn retention_drops_aged_records() {
        let bus = EventBus::with_topics(
            vec![TopicConfig {
                name: "short-topic",
                partitions: 1,
                retention: Duration::from_millis(10),
                max_buffered: 64,
            }],
            true,
        );
        bus.publish("short-topic", "veh_1", json!({"n": 1})).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        // The next append truncates everything past the horizon.
        bus.publish("short-topic", "veh_1", json!({"n": 2})).await;

        let batch = bus.fetch("short-topic", "group-a", 0, FETCH_BYTE_BUDGET);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload["n"], 2);
    }

    #[tokio::test]
    async fn standard_topics_are_wired() {
        let bus = EventBus::new(true);
        assert_eq!(bus.partition_count(TOPIC_LOCATIONS), 32);
        assert_eq!(bus.partition_count(TOPIC_EVENTS), 8);
        assert_eq!(bus.partition_count(TOPIC_ALERTS), 4);
    }
}
