//! Ordered record storage.
//!
//! Records are stored in a single `redb` table keyed by
//! `topic ∥ '@' ∥ fragment (BE u32) ∥ seq (BE u64)`, so a lexicographic
//! scan walks one fragment in sequence order. Values are
//! `node_id (24 bytes) ∥ payload`. Read transactions are MVCC snapshots:
//! a cursor never observes writes committed after it was opened, and
//! readers never block writers.

use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};

pub const NODE_ID_LEN: usize = 24;

const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");
// Per-broker housekeeping (store format marker, local state).
const BROKER_META: TableDefinition<&str, &[u8]> = TableDefinition::new("broker_meta");

const STORE_FILE: &str = "records.redb";

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("store is full")]
    Full,
    #[error("store io: {0}")]
    Io(String),
    #[error("store corruption: {0}")]
    Corruption(String),
    #[error("record node id must be {NODE_ID_LEN} bytes, got {0}")]
    InvalidNodeId(usize),
    #[error("record value shorter than a node id ({0} bytes)")]
    TruncatedValue(usize),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        // ENOSPC maps to the dedicated full marker so the supervisor can
        // stop the broker instead of retrying forever.
        if err.raw_os_error() == Some(28) {
            StorageError::Full
        } else {
            StorageError::Io(err.to_string())
        }
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        match err {
            redb::DatabaseError::Storage(err) => err.into(),
            other => StorageError::Io(other.to_string()),
        }
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        match err {
            redb::StorageError::Io(io) => io.into(),
            redb::StorageError::Corrupted(msg) => StorageError::Corruption(msg),
            other => StorageError::Io(other.to_string()),
        }
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        match err {
            redb::TransactionError::Storage(err) => err.into(),
            other => StorageError::Io(other.to_string()),
        }
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        match err {
            redb::TableError::Storage(err) => err.into(),
            other => StorageError::Corruption(other.to_string()),
        }
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        match err {
            redb::CommitError::Storage(err) => err.into(),
            other => StorageError::Io(other.to_string()),
        }
    }
}

/// Key layout for one record: `topic ∥ '@' ∥ fragment_be32 ∥ seq_be64`.
/// Big-endian integer encoding makes lexicographic order equal numeric
/// order by (fragment, seq). Topic names never contain `@`, so the
/// separator is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey {
    data: Vec<u8>,
}

impl RecordKey {
    pub fn new(topic: &str, fragment: u32, seq: u64) -> Self {
        let mut data = Vec::with_capacity(topic.len() + 1 + 4 + 8);
        data.extend_from_slice(topic.as_bytes());
        data.push(b'@');
        data.extend_from_slice(&fragment.to_be_bytes());
        data.extend_from_slice(&seq.to_be_bytes());
        Self { data }
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < 1 + 4 + 8 {
            return Err(StorageError::Corruption(format!(
                "record key too short: {} bytes",
                data.len()
            )));
        }
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn topic(&self) -> &[u8] {
        &self.data[..self.data.len() - 13]
    }

    pub fn fragment(&self) -> u32 {
        let at = self.data.len() - 12;
        u32::from_be_bytes(self.data[at..at + 4].try_into().expect("fragment bytes"))
    }

    pub fn seq(&self) -> u64 {
        let at = self.data.len() - 8;
        u64::from_be_bytes(self.data[at..].try_into().expect("seq bytes"))
    }
}

/// The exclusive upper bound for all keys under `topic ∥ '@'`.
fn topic_prefix_end(topic: &str) -> Vec<u8> {
    let mut end = Vec::with_capacity(topic.len() + 1);
    end.extend_from_slice(topic.as_bytes());
    end.push(b'@' + 1);
    end
}

/// The exclusive upper bound for all keys of one fragment.
fn fragment_prefix_end(topic: &str, fragment: u32) -> Vec<u8> {
    match fragment.checked_add(1) {
        Some(next) => {
            let mut end = Vec::with_capacity(topic.len() + 5);
            end.extend_from_slice(topic.as_bytes());
            end.push(b'@');
            end.extend_from_slice(&next.to_be_bytes());
            end
        }
        None => topic_prefix_end(topic),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub fragment: u32,
    pub seq: u64,
    pub node_id: Vec<u8>,
    pub payload: Bytes,
}

fn split_value(value: &[u8]) -> Result<(Vec<u8>, Bytes)> {
    if value.len() < NODE_ID_LEN {
        return Err(StorageError::TruncatedValue(value.len()));
    }
    let node_id = value[..NODE_ID_LEN].to_vec();
    let payload = Bytes::copy_from_slice(&value[NODE_ID_LEN..]);
    Ok((node_id, payload))
}

/// Forward cursor over one fragment's records.
///
/// The cursor holds a read snapshot taken when `scan` was called; records
/// committed afterwards are invisible until a fresh scan. The range is
/// bounded to the fragment prefix, so `valid()` going false means the
/// fragment (as of the snapshot) is exhausted.
pub struct RecordCursor {
    range: redb::Range<'static, &'static [u8], &'static [u8]>,
    current: Option<(RecordKey, Vec<u8>)>,
}

impl RecordCursor {
    fn load(&mut self) -> Result<()> {
        self.current = match self.range.next() {
            Some(entry) => {
                let (key, value) = entry?;
                Some((
                    RecordKey::from_bytes(key.value().to_vec())?,
                    value.value().to_vec(),
                ))
            }
            None => None,
        };
        Ok(())
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> Option<&RecordKey> {
        self.current.as_ref().map(|(key, _)| key)
    }

    pub fn value(&self) -> Option<Result<(Vec<u8>, Bytes)>> {
        self.current.as_ref().map(|(_, value)| split_value(value))
    }

    /// Current entry as a parsed record.
    pub fn record(&self) -> Option<Result<Record>> {
        self.current.as_ref().map(|(key, value)| {
            let (node_id, payload) = split_value(value)?;
            Ok(Record {
                fragment: key.fragment(),
                seq: key.seq(),
                node_id,
                payload,
            })
        })
    }

    pub fn next(&mut self) -> Result<()> {
        self.load()
    }
}

/// Durable ordered record store for one broker.
#[derive(Debug)]
pub struct RecordStore {
    db: Database,
    dir: PathBuf,
}

impl RecordStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let db = Database::create(dir.join(STORE_FILE))?;
        // Touching the meta table up front validates the file is writable.
        let txn = db.begin_write()?;
        txn.open_table(BROKER_META)?;
        txn.commit()?;
        Ok(Self { db, dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn put(
        &self,
        topic: &str,
        fragment: u32,
        seq: u64,
        node_id: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        self.put_batch(topic, fragment, seq, &[(node_id, payload)])
    }

    /// Write a contiguous run of records starting at `first_seq` in a single
    /// transaction. Either every record commits or none does.
    pub fn put_batch(
        &self,
        topic: &str,
        fragment: u32,
        first_seq: u64,
        records: &[(&[u8], &[u8])],
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS)?;
            for (index, (node_id, payload)) in records.iter().enumerate() {
                if node_id.len() != NODE_ID_LEN {
                    return Err(StorageError::InvalidNodeId(node_id.len()));
                }
                let key = RecordKey::new(topic, fragment, first_seq + index as u64);
                let mut value = Vec::with_capacity(NODE_ID_LEN + payload.len());
                value.extend_from_slice(node_id);
                value.extend_from_slice(payload);
                table.insert(key.as_bytes(), value.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get(&self, topic: &str, fragment: u32, seq: u64) -> Result<Option<(Vec<u8>, Bytes)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        let key = RecordKey::new(topic, fragment, seq);
        match table.get(key.as_bytes())? {
            Some(guard) => split_value(guard.value()).map(Some),
            None => Ok(None),
        }
    }

    /// Open a snapshot cursor positioned at `(topic, fragment, start_seq)`.
    /// Seeking elsewhere is a fresh `scan`.
    pub fn scan(&self, topic: &str, fragment: u32, start_seq: u64) -> Result<RecordCursor> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        let start = RecordKey::new(topic, fragment, start_seq);
        let end = fragment_prefix_end(topic, fragment);
        let range = table.range::<&[u8]>(start.as_bytes()..end.as_slice())?;
        let mut cursor = RecordCursor {
            range,
            current: None,
        };
        cursor.load()?;
        Ok(cursor)
    }

    /// Highest committed seq for a fragment, or 0 when the fragment is empty.
    pub fn last_seq(&self, topic: &str, fragment: u32) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        let start = RecordKey::new(topic, fragment, 0);
        let end = fragment_prefix_end(topic, fragment);
        let mut range = table.range::<&[u8]>(start.as_bytes()..end.as_slice())?;
        match range.next_back() {
            Some(entry) => {
                let (key, _) = entry?;
                Ok(RecordKey::from_bytes(key.value().to_vec())?.seq())
            }
            None => Ok(0),
        }
    }

    /// Remove every record of every fragment of `topic`.
    pub fn delete_range(&self, topic: &str) -> Result<()> {
        let mut start = topic.as_bytes().to_vec();
        start.push(b'@');
        let end = topic_prefix_end(topic);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS)?;
            let keys: Vec<Vec<u8>> = table
                .range::<&[u8]>(start.as_slice()..end.as_slice())?
                .map(|entry| entry.map(|(key, _)| key.value().to_vec()))
                .collect::<std::result::Result<_, _>>()?;
            for key in keys {
                table.remove(key.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Tear down the store and remove its directory.
    pub fn destroy(self) -> Result<()> {
        let dir = self.dir.clone();
        drop(self);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}
