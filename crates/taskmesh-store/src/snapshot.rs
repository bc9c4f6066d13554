//! Snapshot Storage
//!
//! A snapshot is a payload file plus a meta file carrying a sha256 checksum
//! of the payload. The meta is written only after the payload is durable,
//! so a payload without meta is a detectable partial write and is never
//! loaded. Snapshots are immutable once written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::StoreError;

/// Snapshot payload: the full KV at capture time plus the last log seq.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    pub last_seq: u64,
    pub entries: BTreeMap<String, Vec<u8>>,
}

/// Snapshot descriptor persisted beside the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_seq: u64,
    /// Hex sha256 of the payload bytes.
    pub checksum: String,
    pub payload_len: u64,
}

/// Snapshot directory manager.
pub struct Snapshots {
    dir: PathBuf,
}

fn checksum_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl Snapshots {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn payload_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.snap", name))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", name))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_data().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Write a snapshot. Payload first, meta second; the snapshot exists
    /// only once its meta does.
    pub async fn write(&self, name: &str, data: &SnapshotData) -> Result<SnapshotMeta, StoreError> {
        let payload = serde_json::to_vec(data)?;
        let meta = SnapshotMeta {
            name: name.to_string(),
            created_at: Utc::now(),
            last_seq: data.last_seq,
            checksum: checksum_of(&payload),
            payload_len: payload.len() as u64,
        };
        self.write_atomic(&self.payload_path(name), &payload).await?;
        self.write_atomic(&self.meta_path(name), &serde_json::to_vec(&meta)?)
            .await?;
        Ok(meta)
    }

    /// Metadata for every snapshot with a readable meta file, newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotMeta>, StoreError> {
        let mut metas = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".meta.json") {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            match serde_json::from_slice::<SnapshotMeta>(&bytes) {
                Ok(meta) => metas.push(meta),
                Err(e) => warn!(file = name, error = %e, "Skipping unreadable snapshot meta"),
            }
        }
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(metas)
    }

    /// Verify and load one snapshot by meta.
    pub async fn load(&self, meta: &SnapshotMeta) -> Result<SnapshotData, StoreError> {
        let payload = tokio::fs::read(self.payload_path(&meta.name)).await?;
        if payload.len() as u64 != meta.payload_len {
            return Err(StoreError::Integrity {
                name: meta.name.clone(),
                detail: format!(
                    "payload length {} does not match recorded {}",
                    payload.len(),
                    meta.payload_len
                ),
            });
        }
        let checksum = checksum_of(&payload);
        if checksum != meta.checksum {
            return Err(StoreError::Integrity {
                name: meta.name.clone(),
                detail: "checksum mismatch".to_string(),
            });
        }
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Newest snapshot that passes integrity checks. Invalid candidates are
    /// skipped with a warning and the next-older one is tried.
    pub async fn load_latest(&self) -> Result<Option<(SnapshotMeta, SnapshotData)>, StoreError> {
        for meta in self.list().await? {
            match self.load(&meta).await {
                Ok(data) => return Ok(Some((meta, data))),
                Err(e) => {
                    warn!(snapshot = %meta.name, error = %e, "Skipping invalid snapshot");
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data(seq: u64, marker: &[u8]) -> SnapshotData {
        let mut entries = BTreeMap::new();
        entries.insert("task:t1".to_string(), marker.to_vec());
        SnapshotData {
            last_seq: seq,
            entries,
        }
    }

    #[tokio::test]
    async fn test_write_and_load_latest() {
        let dir = TempDir::new().unwrap();
        let snaps = Snapshots::open(dir.path()).await.unwrap();

        snaps.write("a", &data(3, b"old")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        snaps.write("b", &data(7, b"new")).await.unwrap();

        let (meta, loaded) = snaps.load_latest().await.unwrap().unwrap();
        assert_eq!(meta.name, "b");
        assert_eq!(loaded.last_seq, 7);
        assert_eq!(loaded.entries["task:t1"], b"new");
    }

    #[tokio::test]
    async fn test_corrupt_payload_falls_back_to_older() {
        let dir = TempDir::new().unwrap();
        let snaps = Snapshots::open(dir.path()).await.unwrap();
        snaps.write("good", &data(1, b"good")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        snaps.write("bad", &data(2, b"bad")).await.unwrap();

        // Corrupt the newer payload.
        let path = dir.path().join("bad.snap");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let (meta, loaded) = snaps.load_latest().await.unwrap().unwrap();
        assert_eq!(meta.name, "good");
        assert_eq!(loaded.last_seq, 1);
    }

    #[tokio::test]
    async fn test_payload_without_meta_is_invisible() {
        let dir = TempDir::new().unwrap();
        let snaps = Snapshots::open(dir.path()).await.unwrap();
        // Simulate a crash between payload and meta writes.
        std::fs::write(dir.path().join("partial.snap"), b"{}").unwrap();

        assert!(snaps.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_none_when_empty() {
        let dir = TempDir::new().unwrap();
        let snaps = Snapshots::open(dir.path()).await.unwrap();
        assert!(snaps.load_latest().await.unwrap().is_none());
        assert!(snaps.list().await.unwrap().is_empty());
    }
}
