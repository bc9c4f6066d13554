//! Durable Store
//!
//! Two surfaces over one data directory: an append-only event log and a
//! keyed state KV, plus serialized snapshot capture of both. An `append`
//! that returns has been fsynced; a snapshot that returns is restorable in
//! full (partial writes are detected by checksum and skipped on load).
//!
//! Layout under the root directory:
//!
//! ```text
//! events.log        JSON lines, one event per line, dense seq
//! kv/               one file per key (encoded name)
//! snapshots/        {name}.snap payload + {name}.meta.json
//! ```

mod kv;
mod log;
mod snapshot;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;

use taskmesh_types::{Event, EventBody, ProviderId, TaskId, WorkerId};

pub use kv::KvStore;
pub use log::EventLog;
pub use snapshot::{SnapshotData, SnapshotMeta, Snapshots};

/// KV key for a task record.
pub fn task_key(id: &TaskId) -> String {
    format!("task:{}", id)
}

/// KV key for a worker record.
pub fn worker_key(id: &WorkerId) -> String {
    format!("worker:{}", id)
}

/// KV key for a provider status record.
pub fn provider_key(id: &ProviderId) -> String {
    format!("provider:{}", id)
}

/// KV key holding the ready-queue contents.
pub const KEY_QUEUE: &str = "queue";

/// KV key holding the dependency edge list.
pub const KEY_GRAPH_EDGES: &str = "graph:edges";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Corrupt log record at line {line}: {detail}")]
    CorruptRecord { line: usize, detail: String },

    #[error("Snapshot integrity failure for {name}: {detail}")]
    Integrity { name: String, detail: String },
}

/// The engine's durable storage root.
pub struct DurableStore {
    log: EventLog,
    kv: KvStore,
    snapshots: Snapshots,
    /// Snapshot creation is serialized; two snapshots must not interleave.
    snapshot_gate: Mutex<()>,
    root: PathBuf,
}

impl DurableStore {
    /// Open (or create) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        let log = EventLog::open(root.join("events.log")).await?;
        let kv = KvStore::open(root.join("kv")).await?;
        let snapshots = Snapshots::open(root.join("snapshots")).await?;
        Ok(Self {
            log,
            kv,
            snapshots,
            snapshot_gate: Mutex::new(()),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append an event; the assigned sequence is stamped on the returned
    /// record and has been fsynced when this returns.
    pub async fn append(&self, body: EventBody) -> Result<Event, StoreError> {
        self.log.append(body).await
    }

    /// Sequence of the most recently appended event (0 when empty).
    pub async fn last_seq(&self) -> u64 {
        self.log.last_seq().await
    }

    /// Lazy, finite, restartable read of events with `from <= seq <= to`.
    pub async fn range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<impl futures::Stream<Item = Result<Event, StoreError>>, StoreError> {
        self.log.range(from, to).await
    }

    /// Collect a range into memory. Recovery-sized reads only.
    pub async fn read_range(&self, from: u64, to: u64) -> Result<Vec<Event>, StoreError> {
        self.log.read_range(from, to).await
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.kv.put(key, bytes).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.kv.get(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.kv.delete(key).await
    }

    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.kv.keys().await
    }

    /// Capture the current KV plus the last observed log sequence under
    /// `name`. Returns that sequence. Creation is serialized.
    pub async fn snapshot(&self, name: &str) -> Result<u64, StoreError> {
        let _gate = self.snapshot_gate.lock().await;
        let last_seq = self.log.last_seq().await;
        let mut entries = BTreeMap::new();
        for key in self.kv.keys().await? {
            if let Some(value) = self.kv.get(&key).await? {
                entries.insert(key, value);
            }
        }
        self.snapshots
            .write(name, &SnapshotData { last_seq, entries })
            .await?;
        Ok(last_seq)
    }

    /// Newest snapshot that passes integrity checks, if any. Invalid
    /// snapshots are skipped with a warning.
    pub async fn load_latest_snapshot(
        &self,
    ) -> Result<Option<(SnapshotMeta, SnapshotData)>, StoreError> {
        self.snapshots.load_latest().await
    }

    /// Metadata for every well-formed snapshot, newest first.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotMeta>, StoreError> {
        self.snapshots.list().await
    }
}
