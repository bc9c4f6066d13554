//! Append-Only Event Log
//!
//! One JSON line per event. Appends are serialized behind a mutex so
//! sequence numbers stay dense even when wall-clock timestamps collide,
//! and each append is fsynced before it returns. A torn final line (crash
//! mid-write) is truncated away on open; the interrupted append never
//! reported success, so nothing acknowledged is lost.

use std::path::PathBuf;

use chrono::Utc;
use futures::Stream;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use taskmesh_types::{Event, EventBody};

use crate::StoreError;

struct LogInner {
    file: File,
    last_seq: u64,
}

/// The append-only event log.
pub struct EventLog {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

impl EventLog {
    /// Open the log, scanning existing records to recover the sequence
    /// counter. A trailing partial line is discarded.
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;

        let (last_seq, valid_len, total_len) = Self::scan(&path).await?;
        if valid_len < total_len {
            warn!(
                path = %path.display(),
                torn_bytes = total_len - valid_len,
                "Discarding torn tail of event log"
            );
            file.set_len(valid_len).await?;
            file.seek(std::io::SeekFrom::End(0)).await?;
        }

        Ok(Self {
            path,
            inner: Mutex::new(LogInner { file, last_seq }),
        })
    }

    /// Scan the log file. Returns (last valid seq, byte length of the valid
    /// prefix, total byte length).
    async fn scan(path: &PathBuf) -> Result<(u64, u64, u64), StoreError> {
        let bytes = tokio::fs::read(path).await?;
        let total_len = bytes.len() as u64;
        let mut last_seq = 0u64;
        let mut valid_len = 0u64;
        let mut line_no = 0usize;

        let mut offset = 0usize;
        while let Some(nl) = bytes[offset..].iter().position(|b| *b == b'\n') {
            let line = &bytes[offset..offset + nl];
            line_no += 1;
            match serde_json::from_slice::<Event>(line) {
                Ok(event) => {
                    if event.seq != last_seq + 1 {
                        return Err(StoreError::CorruptRecord {
                            line: line_no,
                            detail: format!(
                                "sequence gap: expected {}, found {}",
                                last_seq + 1,
                                event.seq
                            ),
                        });
                    }
                    last_seq = event.seq;
                    valid_len = (offset + nl + 1) as u64;
                }
                Err(e) => {
                    // A malformed line anywhere but the tail is corruption,
                    // not a torn write.
                    if offset + nl + 1 < bytes.len() {
                        return Err(StoreError::CorruptRecord {
                            line: line_no,
                            detail: e.to_string(),
                        });
                    }
                    break;
                }
            }
            offset += nl + 1;
        }
        Ok((last_seq, valid_len, total_len))
    }

    /// Sequence of the most recently appended event (0 when empty).
    pub async fn last_seq(&self) -> u64 {
        self.inner.lock().await.last_seq
    }

    /// Append one event. Atomic: the sequence is assigned, the line written
    /// and fsynced, all under the log lock.
    pub async fn append(&self, body: EventBody) -> Result<Event, StoreError> {
        let mut inner = self.inner.lock().await;
        let event = Event {
            seq: inner.last_seq + 1,
            ts: Utc::now(),
            kind: body.kind(),
            body,
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        inner.file.write_all(&line).await?;
        inner.file.sync_data().await?;
        inner.last_seq = event.seq;
        Ok(event)
    }

    /// Lazy read of events with `from <= seq <= to`. Opens its own file
    /// handle, so reads run concurrently with appends; the stream ends at
    /// whatever was durable when it was created.
    pub async fn range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<impl Stream<Item = Result<Event, StoreError>>, StoreError> {
        type Cursor = (tokio::io::Lines<BufReader<File>>, u64, u64);

        async fn advance(state: Cursor) -> Result<Option<(Event, Cursor)>, StoreError> {
            let (mut lines, from, to) = state;
            loop {
                let Some(line) = lines.next_line().await? else {
                    return Ok(None);
                };
                let event: Event = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    // Torn tail while a writer is mid-append: end of the
                    // durable prefix.
                    Err(_) => return Ok(None),
                };
                if event.seq > to {
                    return Ok(None);
                }
                if event.seq >= from {
                    return Ok(Some((event, (lines, from, to))));
                }
            }
        }

        let file = File::open(&self.path).await?;
        let lines = BufReader::new(file).lines();
        Ok(futures::stream::try_unfold((lines, from, to), advance))
    }

    /// Collect a range into memory.
    pub async fn read_range(&self, from: u64, to: u64) -> Result<Vec<Event>, StoreError> {
        use futures::TryStreamExt;
        let stream = self.range(from, to).await?;
        stream.try_collect().await
    }
}
