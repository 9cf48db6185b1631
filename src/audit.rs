use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{CoreError, CoreResult};

/// One line of `logs/agent_bridge_audit.jsonl`. Every bridge request gets
/// exactly one entry whose `success` mirrors the terminal frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: i64,
    pub cmd: String,
    pub args_size: usize,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub peer_addr: String,
}

enum AuditOp {
    Append(Box<AuditEntry>),
    Clear(oneshot::Sender<CoreResult<()>>),
    Flush(oneshot::Sender<()>),
}

/// Append-only audit log with a single writer task behind a bounded
/// channel. Writes are best-effort: a full channel drops the entry with a
/// warning instead of blocking the command that produced it.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditOp>,
    path: PathBuf,
}

const CHANNEL_CAPACITY: usize = 1024;

/// Tail reads scan at most this many trailing bytes.
const TAIL_WINDOW: u64 = 512 * 1024;

impl AuditLog {
    /// Spawn the writer task. The log file (and its parent directory) are
    /// created lazily on first append.
    pub fn start(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(writer_loop(path.clone(), rx));
        AuditLog { tx, path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Queue an entry. Never blocks and never fails the caller.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.tx.try_send(AuditOp::Append(Box::new(entry))) {
            tracing::warn!(error = %e, "audit entry dropped");
        }
    }

    /// Truncate the log atomically.
    pub async fn clear(&self) -> CoreResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(AuditOp::Clear(ack_tx))
            .await
            .map_err(|_| CoreError::Internal("audit writer stopped".into()))?;
        ack_rx
            .await
            .map_err(|_| CoreError::Internal("audit writer stopped".into()))?
    }

    /// Wait until every queued entry has reached the file. Used by tests
    /// and by shutdown.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(AuditOp::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Read up to `max_entries` entries from the end of the log, oldest
    /// first. Scans a bounded trailing window rather than the whole file.
    pub fn tail(&self, max_entries: usize) -> CoreResult<Vec<AuditEntry>> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        let window = len.min(TAIL_WINDOW);
        file.seek(SeekFrom::Start(len - window))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;

        let mut lines: Vec<&str> = buf.lines().filter(|l| !l.trim().is_empty()).collect();
        if window < len && !lines.is_empty() {
            // First line of a mid-file window is almost certainly partial.
            lines.remove(0);
        }

        let start = lines.len().saturating_sub(max_entries);
        let mut entries = Vec::with_capacity(lines.len() - start);
        for line in &lines[start..] {
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(error = %e, "skipping unparseable audit line"),
            }
        }
        Ok(entries)
    }
}

async fn writer_loop(path: PathBuf, mut rx: mpsc::Receiver<AuditOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            AuditOp::Append(entry) => {
                if let Err(e) = append_line(&path, &entry) {
                    tracing::warn!(error = %e, path = %path.display(), "audit append failed");
                }
            }
            AuditOp::Clear(ack) => {
                let result = clear_file(&path);
                let _ = ack.send(result);
            }
            AuditOp::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn append_line(path: &PathBuf, entry: &AuditEntry) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(entry).map_err(|e| CoreError::Internal(e.to_string()))?;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

fn clear_file(path: &PathBuf) -> CoreResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let tmp = path.with_extension("jsonl.tmp");
    std::fs::write(&tmp, b"")?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(request_id: i64, cmd: &str, success: bool) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            request_id,
            cmd: cmd.to_string(),
            args_size: 2,
            duration_ms: 5,
            success,
            error: if success { None } else { Some("Blocked".into()) },
            peer_addr: "127.0.0.1:9999".into(),
        }
    }

    #[tokio::test]
    async fn append_then_tail_preserves_order() {
        let dir = tempdir().unwrap();
        let log = AuditLog::start(dir.path().join("logs/agent_bridge_audit.jsonl"));

        for i in 0..5 {
            log.record(entry(i, "get_app_version", true));
        }
        log.flush().await;

        let entries = log.tail(100).unwrap();
        assert_eq!(entries.len(), 5);
        let ids: Vec<i64> = entries.iter().map(|e| e.request_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn tail_limits_to_requested_count() {
        let dir = tempdir().unwrap();
        let log = AuditLog::start(dir.path().join("audit.jsonl"));

        for i in 0..10 {
            log.record(entry(i, "list_message_threads", true));
        }
        log.flush().await;

        let entries = log.tail(3).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].request_id, 7);
        assert_eq!(entries[2].request_id, 9);
    }

    #[tokio::test]
    async fn clear_truncates() {
        let dir = tempdir().unwrap();
        let log = AuditLog::start(dir.path().join("audit.jsonl"));

        log.record(entry(1, "send_message", false));
        log.flush().await;
        assert_eq!(log.tail(10).unwrap().len(), 1);

        log.clear().await.unwrap();
        assert!(log.tail(10).unwrap().is_empty());

        // Appends keep working after a clear.
        log.record(entry(2, "send_message", true));
        log.flush().await;
        assert_eq!(log.tail(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tail_of_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let log = AuditLog::start(dir.path().join("never-written.jsonl"));
        assert!(log.tail(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_entries_carry_error() {
        let dir = tempdir().unwrap();
        let log = AuditLog::start(dir.path().join("audit.jsonl"));
        log.record(entry(7, "reset_everything", false));
        log.flush().await;

        let entries = log.tail(1).unwrap();
        assert!(!entries[0].success);
        assert_eq!(entries[0].error.as_deref(), Some("Blocked"));
    }
}
