//! Coordination-service client interface.
//!
//! The coordination service is the cluster's metadata authority: live
//! broker membership, topic metadata, fragment host registrations and the
//! durable per-fragment last offset. Brokers talk to it through the
//! [`Coordination`] trait; the backing service (a ZooKeeper ensemble in a
//! real deployment) is an external collaborator, so this crate specifies
//! the primitive surface and ships [`MemoryCoordination`], the in-process
//! implementation used by a standalone broker and by tests.
//!
//! Path layout mirrored by every implementation:
//!
//! ```text
//! /brokers/<host:port>                                (ephemeral)
//! /topics/<name>                                      (TopicData blob)
//! /topics/<name>/fragments/<id>
//! /topics/<name>/fragments/<id>/brokers/<host:port>   (ephemeral)
//! /topics/<name>/fragments/<id>/data                  (FragmentData blob)
//! ```

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub type Result<T> = std::result::Result<T, CoordinationError>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum CoordinationError {
    #[error("coordination path not found: {0}")]
    NotFound(String),
    #[error("coordination path already exists: {0}")]
    AlreadyExists(String),
    #[error("coordination unavailable: {0}")]
    Unavailable(String),
    #[error("invalid coordination data at {path}: {reason}")]
    InvalidData { path: String, reason: String },
    #[error("invalid topic name {0:?}")]
    InvalidTopicName(String),
}

/// Topic names become path components and record-key prefixes, so the
/// separators are reserved.
pub fn validate_topic_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('@') {
        return Err(CoordinationError::InvalidTopicName(name.to_string()));
    }
    Ok(())
}

const U64_LEN: usize = 8;
const U32_LEN: usize = 4;

/// Topic metadata blob stored at `/topics/<name>`.
///
/// Layout (all integers big-endian): `last_offset (u64) ∥ num_publishers
/// (u64) ∥ num_subscribers (u64) ∥ num_fragments (u32) ∥
/// replication_factor (u32) ∥ description (UTF-8, remainder)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicData {
    pub last_offset: u64,
    pub num_publishers: u64,
    pub num_subscribers: u64,
    pub num_fragments: u32,
    pub replication_factor: u32,
    pub description: String,
}

impl TopicData {
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(U64_LEN * 3 + U32_LEN * 2 + self.description.len());
        data.extend_from_slice(&self.last_offset.to_be_bytes());
        data.extend_from_slice(&self.num_publishers.to_be_bytes());
        data.extend_from_slice(&self.num_subscribers.to_be_bytes());
        data.extend_from_slice(&self.num_fragments.to_be_bytes());
        data.extend_from_slice(&self.replication_factor.to_be_bytes());
        data.extend_from_slice(self.description.as_bytes());
        data
    }

    pub fn decode(data: &[u8]) -> std::result::Result<Self, String> {
        let fixed = U64_LEN * 3 + U32_LEN * 2;
        if data.len() < fixed {
            return Err(format!("blob too short: {} bytes", data.len()));
        }
        let u64_at = |at: usize| u64::from_be_bytes(data[at..at + U64_LEN].try_into().unwrap());
        let u32_at = |at: usize| u32::from_be_bytes(data[at..at + U32_LEN].try_into().unwrap());
        let description = std::str::from_utf8(&data[fixed..])
            .map_err(|err| format!("description is not utf-8: {err}"))?
            .to_string();
        Ok(Self {
            last_offset: u64_at(0),
            num_publishers: u64_at(U64_LEN),
            num_subscribers: u64_at(U64_LEN * 2),
            num_fragments: u32_at(U64_LEN * 3),
            replication_factor: u32_at(U64_LEN * 3 + U32_LEN),
            description,
        })
    }
}

/// Fragment metadata blob stored at `/topics/<t>/fragments/<id>/data`:
/// `last_offset (u64) ∥ num_publishers (u64) ∥ num_subscribers (u64)`,
/// big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentData {
    pub last_offset: u64,
    pub num_publishers: u64,
    pub num_subscribers: u64,
}

impl FragmentData {
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(U64_LEN * 3);
        data.extend_from_slice(&self.last_offset.to_be_bytes());
        data.extend_from_slice(&self.num_publishers.to_be_bytes());
        data.extend_from_slice(&self.num_subscribers.to_be_bytes());
        data
    }

    pub fn decode(data: &[u8]) -> std::result::Result<Self, String> {
        if data.len() < U64_LEN * 3 {
            return Err(format!("blob too short: {} bytes", data.len()));
        }
        let u64_at = |at: usize| u64::from_be_bytes(data[at..at + U64_LEN].try_into().unwrap());
        Ok(Self {
            last_offset: u64_at(0),
            num_publishers: u64_at(U64_LEN),
            num_subscribers: u64_at(U64_LEN * 2),
        })
    }
}

/// Creation-time topic metadata.
#[derive(Debug, Clone)]
pub struct TopicMeta {
    pub description: String,
    pub num_fragments: u32,
    pub replication_factor: u32,
}

/// Primitive coordination operations the broker relies on.
///
/// Counter adjustments and last-offset updates are atomic on the backing
/// service. Ephemeral registrations (`register_broker`,
/// `register_fragment_host`) disappear with the owning session on a real
/// backend; implementations backed by process memory drop them on
/// explicit deregistration.
#[async_trait]
pub trait Coordination: Send + Sync {
    async fn ensure_paths(&self) -> Result<()>;

    async fn register_broker(&self, addr: &str) -> Result<()>;
    async fn deregister_broker(&self, addr: &str) -> Result<()>;
    async fn brokers(&self) -> Result<Vec<String>>;

    async fn create_topic(&self, name: &str, meta: TopicMeta) -> Result<()>;
    async fn delete_topic(&self, name: &str) -> Result<()>;
    async fn topic_data(&self, name: &str) -> Result<TopicData>;
    async fn topics(&self) -> Result<Vec<String>>;

    async fn register_fragment_host(&self, topic: &str, fragment: u32, addr: &str) -> Result<()>;
    async fn deregister_fragment_host(&self, topic: &str, fragment: u32, addr: &str) -> Result<()>;
    async fn deregister_host_everywhere(&self, addr: &str) -> Result<()>;
    async fn fragment_hosts(&self, topic: &str, fragment: u32) -> Result<Vec<String>>;

    async fn fragment_data(&self, topic: &str, fragment: u32) -> Result<FragmentData>;
    /// Persist a new last offset; the stored value never decreases.
    async fn set_last_offset(&self, topic: &str, fragment: u32, last_offset: u64) -> Result<()>;
    /// Atomically adjust the publisher/subscriber counters of one fragment.
    async fn adjust_session_counters(
        &self,
        topic: &str,
        fragment: u32,
        publishers: i64,
        subscribers: i64,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
struct FragmentEntry {
    data: FragmentData,
    hosts: HashSet<String>,
}

#[derive(Debug, Default)]
struct TopicEntry {
    data: TopicData,
    fragments: HashMap<u32, FragmentEntry>,
}

#[derive(Debug, Default)]
struct Registry {
    brokers: HashSet<String>,
    topics: HashMap<String, TopicEntry>,
}

/// In-process coordination backend.
#[derive(Debug, Default)]
pub struct MemoryCoordination {
    registry: Mutex<Registry>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_fragment<T>(
        &self,
        topic: &str,
        fragment: u32,
        f: impl FnOnce(&mut FragmentEntry) -> T,
    ) -> Result<T> {
        let mut registry = self.registry.lock().expect("coordination registry lock");
        let entry = registry
            .topics
            .get_mut(topic)
            .ok_or_else(|| CoordinationError::NotFound(format!("/topics/{topic}")))?;
        let fragment_entry = entry.fragments.get_mut(&fragment).ok_or_else(|| {
            CoordinationError::NotFound(format!("/topics/{topic}/fragments/{fragment}"))
        })?;
        Ok(f(fragment_entry))
    }
}

fn saturating_adjust(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

#[async_trait]
impl Coordination for MemoryCoordination {
    async fn ensure_paths(&self) -> Result<()> {
        Ok(())
    }

    async fn register_broker(&self, addr: &str) -> Result<()> {
        let mut registry = self.registry.lock().expect("coordination registry lock");
        registry.brokers.insert(addr.to_string());
        Ok(())
    }

    async fn deregister_broker(&self, addr: &str) -> Result<()> {
        let mut registry = self.registry.lock().expect("coordination registry lock");
        registry.brokers.remove(addr);
        Ok(())
    }

    async fn brokers(&self) -> Result<Vec<String>> {
        let registry = self.registry.lock().expect("coordination registry lock");
        Ok(registry.brokers.iter().cloned().collect())
    }

    async fn create_topic(&self, name: &str, meta: TopicMeta) -> Result<()> {
        validate_topic_name(name)?;
        let mut registry = self.registry.lock().expect("coordination registry lock");
        if registry.topics.contains_key(name) {
            return Err(CoordinationError::AlreadyExists(format!("/topics/{name}")));
        }
        let fragments = (0..meta.num_fragments)
            .map(|id| (id, FragmentEntry::default()))
            .collect();
        registry.topics.insert(
            name.to_string(),
            TopicEntry {
                data: TopicData {
                    num_fragments: meta.num_fragments,
                    replication_factor: meta.replication_factor,
                    description: meta.description,
                    ..TopicData::default()
                },
                fragments,
            },
        );
        Ok(())
    }

    async fn delete_topic(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock().expect("coordination registry lock");
        registry
            .topics
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CoordinationError::NotFound(format!("/topics/{name}")))
    }

    async fn topic_data(&self, name: &str) -> Result<TopicData> {
        let registry = self.registry.lock().expect("coordination registry lock");
        registry
            .topics
            .get(name)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| CoordinationError::NotFound(format!("/topics/{name}")))
    }

    async fn topics(&self) -> Result<Vec<String>> {
        let registry = self.registry.lock().expect("coordination registry lock");
        let mut names: Vec<String> = registry.topics.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn register_fragment_host(&self, topic: &str, fragment: u32, addr: &str) -> Result<()> {
        self.with_fragment(topic, fragment, |entry| {
            entry.hosts.insert(addr.to_string());
        })
    }

    async fn deregister_fragment_host(&self, topic: &str, fragment: u32, addr: &str) -> Result<()> {
        self.with_fragment(topic, fragment, |entry| {
            entry.hosts.remove(addr);
        })
    }

    async fn deregister_host_everywhere(&self, addr: &str) -> Result<()> {
        let mut registry = self.registry.lock().expect("coordination registry lock");
        for entry in registry.topics.values_mut() {
            for fragment in entry.fragments.values_mut() {
                fragment.hosts.remove(addr);
            }
        }
        Ok(())
    }

    async fn fragment_hosts(&self, topic: &str, fragment: u32) -> Result<Vec<String>> {
        self.with_fragment(topic, fragment, |entry| {
            let mut hosts: Vec<String> = entry.hosts.iter().cloned().collect();
            hosts.sort();
            hosts
        })
    }

    async fn fragment_data(&self, topic: &str, fragment: u32) -> Result<FragmentData> {
        self.with_fragment(topic, fragment, |entry| entry.data)
    }

    async fn set_last_offset(&self, topic: &str, fragment: u32, last_offset: u64) -> Result<()> {
        self.with_fragment(topic, fragment, |entry| {
            entry.data.last_offset = entry.data.last_offset.max(last_offset);
        })
    }

    async fn adjust_session_counters(
        &self,
        topic: &str,
        fragment: u32,
        publishers: i64,
        subscribers: i64,
    ) -> Result<()> {
        self.with_fragment(topic, fragment, |entry| {
            entry.data.num_publishers = saturating_adjust(entry.data.num_publishers, publishers);
            entry.data.num_subscribers = saturating_adjust(entry.data.num_subscribers, subscribers);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(fragments: u32) -> TopicMeta {
        TopicMeta {
            description: "test topic".to_string(),
            num_fragments: fragments,
            replication_factor: 1,
        }
    }

    #[test]
    fn topic_data_blob_round_trips() {
        let data = TopicData {
            last_offset: 99,
            num_publishers: 2,
            num_subscribers: 5,
            num_fragments: 3,
            replication_factor: 2,
            description: "orders topic".to_string(),
        };
        let decoded = TopicData::decode(&data.encode()).expect("decode");
        assert_eq!(decoded, data);
    }

    #[test]
    fn topic_data_fields_do_not_overlap() {
        // Each field decodes from its own slice of the blob.
        let data = TopicData {
            last_offset: u64::MAX,
            num_publishers: 1,
            num_subscribers: 2,
            num_fragments: u32::MAX,
            replication_factor: 7,
            description: String::new(),
        };
        let decoded = TopicData::decode(&data.encode()).expect("decode");
        assert_eq!(decoded.last_offset, u64::MAX);
        assert_eq!(decoded.num_publishers, 1);
        assert_eq!(decoded.num_subscribers, 2);
        assert_eq!(decoded.num_fragments, u32::MAX);
        assert_eq!(decoded.replication_factor, 7);
    }

    #[test]
    fn fragment_data_blob_round_trips() {
        let data = FragmentData {
            last_offset: 3,
            num_publishers: 1,
            num_subscribers: 4,
        };
        assert_eq!(FragmentData::decode(&data.encode()).expect("decode"), data);
        assert!(FragmentData::decode(&[0u8; 7]).is_err());
    }

    #[test]
    fn topic_names_reject_reserved_separators() {
        assert!(validate_topic_name("orders").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/b").is_err());
        assert!(validate_topic_name("a@b").is_err());
    }

    #[tokio::test]
    async fn create_topic_is_exclusive() {
        let coordination = MemoryCoordination::new();
        coordination.create_topic("t1", meta(2)).await.expect("create");
        let err = coordination
            .create_topic("t1", meta(2))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, CoordinationError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn last_offset_never_decreases() {
        let coordination = MemoryCoordination::new();
        coordination.create_topic("t1", meta(1)).await.expect("create");
        coordination.set_last_offset("t1", 0, 5).await.expect("set");
        coordination.set_last_offset("t1", 0, 3).await.expect("set");
        let data = coordination.fragment_data("t1", 0).await.expect("data");
        assert_eq!(data.last_offset, 5);
    }

    #[tokio::test]
    async fn counters_adjust_and_saturate() {
        let coordination = MemoryCoordination::new();
        coordination.create_topic("t1", meta(1)).await.expect("create");
        coordination
            .adjust_session_counters("t1", 0, 2, 1)
            .await
            .expect("adjust");
        coordination
            .adjust_session_counters("t1", 0, -3, -1)
            .await
            .expect("adjust");
        let data = coordination.fragment_data("t1", 0).await.expect("data");
        assert_eq!(data.num_publishers, 0);
        assert_eq!(data.num_subscribers, 0);
    }

    #[tokio::test]
    async fn fragment_lookup_of_missing_topic_is_not_found() {
        let coordination = MemoryCoordination::new();
        let err = coordination
            .fragment_data("missing", 0)
            .await
            .expect_err("missing");
        assert!(matches!(err, CoordinationError::NotFound(_)));
    }

    #[tokio::test]
    async fn host_registrations_follow_broker_lifecycle() {
        let coordination = MemoryCoordination::new();
        coordination.create_topic("t1", meta(2)).await.expect("create");
        coordination.register_broker("10.0.0.1:1101").await.expect("broker");
        coordination
            .register_fragment_host("t1", 0, "10.0.0.1:1101")
            .await
            .expect("host");
        coordination
            .register_fragment_host("t1", 1, "10.0.0.1:1101")
            .await
            .expect("host");
        assert_eq!(
            coordination.fragment_hosts("t1", 0).await.expect("hosts"),
            vec!["10.0.0.1:1101".to_string()]
        );

        coordination
            .deregister_host_everywhere("10.0.0.1:1101")
            .await
            .expect("deregister");
        assert!(coordination.fragment_hosts("t1", 1).await.expect("hosts").is_empty());
    }
}
