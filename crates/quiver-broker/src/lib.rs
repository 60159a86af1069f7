//! Broker core.
//!
//! Owns the pieces every transport session shares: the record store, the
//! coordination client, the notifier, the per-fragment commit state and
//! the coalesced last-offset flush. The append path holds one fragment's
//! lock across sequence assignment, the batched store write and the
//! notifier signal, which is what keeps committed sequence numbers
//! strictly increasing and contiguous per fragment no matter how many
//! sessions publish into it.

use bytes::Bytes;
use dashmap::DashMap;
use quiver_coordination::{Coordination, CoordinationError, FragmentData, TopicMeta};
use quiver_storage::{RecordCursor, RecordStore, StorageError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

pub mod notifier;

pub use notifier::{FragmentKey, Notifier};

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("topic {0} does not exist")]
    TopicNotExists(String),
    #[error("topic {0} already exists")]
    TopicAlreadyExists(String),
    #[error("invalid topic name {0:?}")]
    InvalidTopicName(String),
    #[error("coordination unavailable: {0}")]
    CoordinationUnavailable(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<CoordinationError> for CoreError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::NotFound(path) => {
                // The only paths the core resolves are topic-scoped.
                CoreError::TopicNotExists(topic_from_path(&path))
            }
            CoordinationError::AlreadyExists(path) => {
                CoreError::TopicAlreadyExists(topic_from_path(&path))
            }
            CoordinationError::InvalidTopicName(name) => CoreError::InvalidTopicName(name),
            other => CoreError::CoordinationUnavailable(other.to_string()),
        }
    }
}

fn topic_from_path(path: &str) -> String {
    path.strip_prefix("/topics/")
        .map(|rest| rest.split('/').next().unwrap_or(rest))
        .unwrap_or(path)
        .to_string()
}

/// Snapshot returned by [`Broker::describe_topic`]. Counter fields
/// aggregate across the topic's fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescription {
    pub description: String,
    pub num_fragments: u32,
    pub replication_factor: u32,
    pub num_publishers: u64,
    pub num_subscribers: u64,
}

#[derive(Debug, Default)]
struct FragmentState {
    // None until the first append or last-offset query touches the
    // fragment on this broker.
    last_committed: Option<u64>,
}

pub struct Broker {
    store: RecordStore,
    coordination: Arc<dyn Coordination>,
    notifier: Notifier,
    fragments: DashMap<FragmentKey, Arc<Mutex<FragmentState>>>,
    // Fragments with commits not yet flushed to coordination.
    dirty: StdMutex<HashMap<FragmentKey, u64>>,
    coordination_timeout: Duration,
}

impl Broker {
    pub fn new(
        store: RecordStore,
        coordination: Arc<dyn Coordination>,
        coordination_timeout: Duration,
    ) -> Self {
        Self {
            store,
            coordination,
            notifier: Notifier::new(),
            fragments: DashMap::new(),
            dirty: StdMutex::new(HashMap::new()),
            coordination_timeout,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn coordination(&self) -> &Arc<dyn Coordination> {
        &self.coordination
    }

    /// Run a coordination call under the configured deadline.
    async fn coordinate<T>(
        &self,
        fut: impl std::future::Future<Output = quiver_coordination::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.coordination_timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(CoreError::CoordinationUnavailable(format!(
                "call exceeded {:?} deadline",
                self.coordination_timeout
            ))),
        }
    }

    pub async fn create_topic(
        &self,
        name: &str,
        description: &str,
        num_fragments: u32,
        replication_factor: u32,
    ) -> Result<()> {
        let meta = TopicMeta {
            description: description.to_string(),
            num_fragments: num_fragments.max(1),
            replication_factor,
        };
        self.coordinate(self.coordination.create_topic(name, meta))
            .await?;
        tracing::info!(topic = name, num_fragments, "topic created");
        Ok(())
    }

    /// Remove the topic from coordination and issue the ranged delete over
    /// the store prefix. Cached fragment state is invalidated so a
    /// recreated topic starts its sequence space from 1 again.
    pub async fn delete_topic(&self, name: &str) -> Result<()> {
        self.coordinate(self.coordination.delete_topic(name))
            .await?;
        self.store.delete_range(name)?;
        self.fragments.retain(|key, _| key.topic != name);
        self.dirty
            .lock()
            .expect("dirty set lock")
            .retain(|key, _| key.topic != name);
        tracing::info!(topic = name, "topic deleted");
        Ok(())
    }

    pub async fn describe_topic(&self, name: &str) -> Result<TopicDescription> {
        let data = self.coordinate(self.coordination.topic_data(name)).await?;
        let mut num_publishers = 0;
        let mut num_subscribers = 0;
        for fragment in 0..data.num_fragments {
            let fragment_data = self
                .coordinate(self.coordination.fragment_data(name, fragment))
                .await?;
            num_publishers += fragment_data.num_publishers;
            num_subscribers += fragment_data.num_subscribers;
        }
        Ok(TopicDescription {
            description: data.description,
            num_fragments: data.num_fragments,
            replication_factor: data.replication_factor,
            num_publishers,
            num_subscribers,
        })
    }

    pub async fn list_topics(&self) -> Result<Vec<String>> {
        self.coordinate(self.coordination.topics()).await
    }

    pub async fn fragment_hosts(&self, topic: &str, fragment: u32) -> Result<Vec<String>> {
        self.coordinate(self.coordination.fragment_hosts(topic, fragment))
            .await
    }

    pub async fn register_fragment_host(
        &self,
        topic: &str,
        fragment: u32,
        addr: &str,
    ) -> Result<()> {
        self.coordinate(
            self.coordination
                .register_fragment_host(topic, fragment, addr),
        )
        .await
    }

    /// Atomically adjust one fragment's publisher/subscriber counters.
    pub async fn adjust_session_counters(
        &self,
        topic: &str,
        fragment: u32,
        publishers: i64,
        subscribers: i64,
    ) -> Result<()> {
        self.coordinate(self.coordination.adjust_session_counters(
            topic,
            fragment,
            publishers,
            subscribers,
        ))
        .await
    }

    pub async fn register_broker(&self, addr: &str) -> Result<()> {
        self.coordinate(self.coordination.ensure_paths()).await?;
        self.coordinate(self.coordination.register_broker(addr))
            .await
    }

    /// Remove this broker's ephemeral registrations: the broker node and
    /// every fragment host entry it created.
    pub async fn deregister_broker(&self, addr: &str) -> Result<()> {
        self.coordinate(self.coordination.deregister_broker(addr))
            .await?;
        self.coordinate(self.coordination.deregister_host_everywhere(addr))
            .await
    }

    pub async fn topic_exists(&self, name: &str) -> Result<bool> {
        match self.coordinate(self.coordination.topic_data(name)).await {
            Ok(_) => Ok(true),
            Err(CoreError::TopicNotExists(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn fragment_cell(&self, key: &FragmentKey) -> Arc<Mutex<FragmentState>> {
        self.fragments
            .entry(key.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Resolve the fragment's committed tail, consulting the durable
    /// last-offset counter and the local store on first touch. The store
    /// can be ahead of coordination after a crash between commit and
    /// flush, so the larger of the two wins.
    async fn init_last_committed(&self, key: &FragmentKey) -> Result<u64> {
        let data: FragmentData = self
            .coordinate(self.coordination.fragment_data(&key.topic, key.fragment))
            .await?;
        let stored = self.store.last_seq(&key.topic, key.fragment)?;
        Ok(data.last_offset.max(stored))
    }

    /// Append a batch of records to one fragment, assigning contiguous
    /// sequence numbers. Returns the assigned sequence numbers in input
    /// order. The notifier fires exactly once per batch.
    pub async fn append(
        &self,
        topic: &str,
        fragment: u32,
        records: &[(&[u8], Bytes)],
    ) -> Result<Vec<u64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        // Existence is re-checked per batch so appends racing a topic
        // deletion fail instead of resurrecting the key range.
        if !self.topic_exists(topic).await? {
            return Err(CoreError::TopicNotExists(topic.to_string()));
        }

        let key = FragmentKey::new(topic, fragment);
        let cell = self.fragment_cell(&key);
        let mut state = cell.lock().await;
        let last = match state.last_committed {
            Some(last) => last,
            None => self.init_last_committed(&key).await?,
        };

        let first_seq = last + 1;
        let rows: Vec<(&[u8], &[u8])> = records
            .iter()
            .map(|(node_id, payload)| (*node_id, payload.as_ref()))
            .collect();
        self.store.put_batch(topic, fragment, first_seq, &rows)?;

        let new_last = last + records.len() as u64;
        state.last_committed = Some(new_last);
        // Notify under the fragment lock so wakeups observe commits in
        // sequence order across concurrent publishers.
        self.notifier.notify(topic, fragment, new_last);
        drop(state);

        self.dirty
            .lock()
            .expect("dirty set lock")
            .entry(key)
            .and_modify(|offset| *offset = (*offset).max(new_last))
            .or_insert(new_last);

        metrics::counter!("quiver_records_appended_total").increment(records.len() as u64);

        Ok((first_seq..=new_last).collect())
    }

    /// Current committed tail of a fragment as this broker sees it.
    pub async fn last_offset(&self, topic: &str, fragment: u32) -> Result<u64> {
        let key = FragmentKey::new(topic, fragment);
        let cell = self.fragment_cell(&key);
        let mut state = cell.lock().await;
        match state.last_committed {
            Some(last) => Ok(last),
            None => {
                let last = self.init_last_committed(&key).await?;
                state.last_committed = Some(last);
                Ok(last)
            }
        }
    }

    pub fn scan(&self, topic: &str, fragment: u32, start_seq: u64) -> Result<RecordCursor> {
        Ok(self.store.scan(topic, fragment, start_seq)?)
    }

    /// Push every dirty fragment's last offset to coordination. Called on
    /// the flush interval and during shutdown; failures leave the entry
    /// dirty for the next pass.
    pub async fn flush_offsets(&self) -> Result<()> {
        let pending: Vec<(FragmentKey, u64)> = {
            let mut dirty = self.dirty.lock().expect("dirty set lock");
            dirty.drain().collect()
        };
        for (key, offset) in pending {
            let result = self
                .coordinate(
                    self.coordination
                        .set_last_offset(&key.topic, key.fragment, offset),
                )
                .await;
            match result {
                Ok(()) => {}
                // The topic vanished under us: nothing left to flush.
                Err(CoreError::TopicNotExists(_)) => {}
                Err(err) => {
                    tracing::warn!(
                        topic = %key.topic,
                        fragment = key.fragment,
                        error = %err,
                        "last-offset flush failed; will retry"
                    );
                    self.dirty
                        .lock()
                        .expect("dirty set lock")
                        .entry(key)
                        .and_modify(|existing| *existing = (*existing).max(offset))
                        .or_insert(offset);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn has_dirty_offsets(&self) -> bool {
        !self.dirty.lock().expect("dirty set lock").is_empty()
    }

    /// Destroy the store. Used by tests and the broker's clean path.
    pub fn clean(self) -> Result<()> {
        self.store.destroy()?;
        Ok(())
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("store", &self.store.path())
            .field("coordination_timeout", &self.coordination_timeout)
            .finish()
    }
}
