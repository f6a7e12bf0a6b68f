//! Transaction log
//!
//! Optional append-only JSON-lines log of raw traffic (timestamp,
//! direction, hex bytes). Entries go through a bounded queue to a
//! background writer so the hot path never blocks on disk; when the queue
//! is full the entry is dropped and counted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::utils::error::{Result, UmdtError};

/// One logged transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// `TX`, `RX`, or `STATUS`
    pub direction: String,
    /// Hex-encoded raw bytes (or a status message)
    pub data: String,
}

impl LogEntry {
    pub fn frame(direction: &str, raw: &[u8]) -> Self {
        Self {
            timestamp: Utc::now(),
            direction: direction.to_string(),
            data: hex::encode_upper(raw),
        }
    }

    pub fn status(message: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            direction: "STATUS".to_string(),
            data: message.to_string(),
        }
    }
}

/// Append-only JSONL transaction logger.
pub struct TransactionLog {
    path: PathBuf,
    tx: mpsc::Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl TransactionLog {
    /// Open (append) the log file and start the writer task.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| UmdtError::Io(format!("cannot open {}: {e}", path.display())))?;

        let (tx, mut rx) = mpsc::channel::<LogEntry>(512);
        let task = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let mut line = match serde_json::to_vec(&entry) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("[TransLog] serialization failed: {}", e);
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = file.write_all(&line).await {
                    warn!("[TransLog] write failed: {}", e);
                    break;
                }
            }
            let _ = file.flush().await;
        });

        Ok(Self {
            path,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            task,
        })
    }

    /// Queue an entry; drops (and counts) when the writer is saturated.
    pub fn log(&self, entry: LogEntry) {
        if self.tx.try_send(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Entries lost to queue overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the writer, flushing everything queued.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trans.jsonl");
        let log = TransactionLog::open(&path).await.unwrap();

        log.log(LogEntry::frame("TX", &[0x01, 0x03, 0x00, 0x00]));
        log.log(LogEntry::frame("RX", &[0x01, 0x03, 0x02, 0x00, 0x2A]));
        log.log(LogEntry::status("connected"));
        log.close().await;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: LogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.direction, "TX");
        assert_eq!(first.data, "01030000");
        let last: LogEntry = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last.direction, "STATUS");
    }

    #[tokio::test]
    async fn test_append_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trans.jsonl");

        let log = TransactionLog::open(&path).await.unwrap();
        log.log(LogEntry::status("first"));
        log.close().await;

        let log = TransactionLog::open(&path).await.unwrap();
        log.log(LogEntry::status("second"));
        assert_eq!(log.dropped(), 0);
        log.close().await;

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
