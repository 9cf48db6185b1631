use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::SyftboxBackendKind;
use crate::error::CoreResult;

use super::queue::{QueueEntry, QueueState, QueueStatus};
use super::{BackendInfo, SyncBackend};

/// In-process sync backend.
///
/// Instead of talking to a remote server it walks the local `datasites/`
/// tree: files queued in `rpc/` directories are accounted as transfers
/// (outbound when addressed to a peer, inbound when addressed to the
/// owner). Co-located profiles sharing one data dir therefore see each
/// other's writes immediately, which is also what the test suite runs on.
/// The backend only observes the tree; it never moves message files.
pub struct EmbeddedBackend {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
}

struct Shared {
    data_dir: PathBuf,
    owner: String,
    running: AtomicBool,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    queue: std::sync::Mutex<HashMap<String, QueueEntry>>,
    seen: std::sync::Mutex<HashSet<PathBuf>>,
    kick: Notify,
}

/// Completed entries retained for telemetry.
const QUEUE_HISTORY_CAP: usize = 256;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

impl EmbeddedBackend {
    pub fn new(data_dir: PathBuf, owner: &str) -> Self {
        Self::with_interval(data_dir, owner, DEFAULT_INTERVAL)
    }

    pub fn with_interval(data_dir: PathBuf, owner: &str, interval: Duration) -> Self {
        EmbeddedBackend {
            shared: Arc::new(Shared {
                data_dir,
                owner: owner.to_ascii_lowercase(),
                running: AtomicBool::new(false),
                tx_bytes: AtomicU64::new(0),
                rx_bytes: AtomicU64::new(0),
                queue: std::sync::Mutex::new(HashMap::new()),
                seen: std::sync::Mutex::new(HashSet::new()),
                kick: Notify::new(),
            }),
            task: Mutex::new(None),
            interval,
        }
    }
}

#[async_trait::async_trait]
impl SyncBackend for EmbeddedBackend {
    fn kind(&self) -> SyftboxBackendKind {
        SyftboxBackendKind::Embedded
    }

    async fn start(&self) -> CoreResult<BackendInfo> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(BackendInfo::default());
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            while shared.running.load(Ordering::SeqCst) {
                run_pass(&shared);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shared.kick.notified() => {}
                }
            }
        }));
        tracing::info!(data_dir = %self.shared.data_dir.display(), "embedded sync loop started");
        Ok(BackendInfo::default())
    }

    async fn stop(&self) -> CoreResult<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.kick.notify_one();
        if let Some(handle) = self.task.lock().await.take() {
            // The loop observes the flag on its next wake; don't wait
            // longer than that.
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                tracing::warn!("embedded sync loop did not stop in time");
            }
        }
        Ok(())
    }

    async fn trigger_sync(&self) -> CoreResult<()> {
        self.shared.kick.notify_one();
        Ok(())
    }

    async fn queue_snapshot(&self) -> CoreResult<QueueStatus> {
        let entries: Vec<QueueEntry> = self.shared.queue.lock().unwrap().values().cloned().collect();
        Ok(QueueStatus::from_entries(entries))
    }

    fn transfer_counters(&self) -> (u64, u64) {
        (
            self.shared.tx_bytes.load(Ordering::SeqCst),
            self.shared.rx_bytes.load(Ordering::SeqCst),
        )
    }

    async fn websocket_connected(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

fn run_pass(shared: &Shared) {
    let datasites = shared.data_dir.join("datasites");
    let Ok(sites) = std::fs::read_dir(&datasites) else {
        return;
    };

    for site in sites.flatten() {
        let email = site.file_name().to_string_lossy().to_string();
        let rpc_dir = site.path().join("app_data").join("biovault").join("rpc");
        if !rpc_dir.is_dir() {
            continue;
        }
        let inbound = email == shared.owner;
        scan_rpc_dir(shared, &rpc_dir, inbound);
    }

    // Keep the queue map bounded; drop the oldest completed entries first.
    let mut queue = shared.queue.lock().unwrap();
    if queue.len() > QUEUE_HISTORY_CAP {
        let mut completed: Vec<(String, chrono::DateTime<Utc>)> = queue
            .iter()
            .filter(|(_, e)| e.state == QueueState::Completed)
            .map(|(k, e)| (k.clone(), e.updated_at))
            .collect();
        completed.sort_by_key(|(_, at)| *at);
        let excess = queue.len() - QUEUE_HISTORY_CAP;
        for (key, _) in completed.into_iter().take(excess) {
            queue.remove(&key);
        }
    }
}

fn scan_rpc_dir(shared: &Shared, dir: &Path, inbound: bool) {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if shared.seen.lock().unwrap().contains(&path) {
                continue;
            }

            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if inbound {
                shared.rx_bytes.fetch_add(size, Ordering::SeqCst);
            } else {
                shared.tx_bytes.fetch_add(size, Ordering::SeqCst);
            }
            shared.seen.lock().unwrap().insert(path.clone());

            let rel = path
                .strip_prefix(&shared.data_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            shared.queue.lock().unwrap().insert(
                rel.clone(),
                QueueEntry {
                    path: rel,
                    state: QueueState::Completed,
                    progress: Some(1.0),
                    size: Some(size),
                    updated_at: Utc::now(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue_file(data_dir: &Path, site: &str, name: &str, bytes: &[u8]) {
        let dir = data_dir
            .join("datasites")
            .join(site)
            .join("app_data/biovault/rpc/message");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    async fn settle(backend: &EmbeddedBackend) {
        backend.trigger_sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn counts_inbound_and_outbound_bytes() {
        let dir = tempdir().unwrap();
        let backend =
            EmbeddedBackend::with_interval(dir.path().to_path_buf(), "a@x", Duration::from_secs(60));
        backend.start().await.unwrap();

        queue_file(dir.path(), "a@x", "in.json", b"0123456789"); // inbound, 10 bytes
        queue_file(dir.path(), "b@x", "out.json", b"01234"); // outbound, 5 bytes
        settle(&backend).await;

        let (tx, rx) = backend.transfer_counters();
        assert_eq!(rx, 10);
        assert_eq!(tx, 5);

        let queue = backend.queue_snapshot().await.unwrap();
        assert_eq!(queue.summary.completed, 2);
        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn counters_are_monotonic_across_restart() {
        let dir = tempdir().unwrap();
        let backend =
            EmbeddedBackend::with_interval(dir.path().to_path_buf(), "a@x", Duration::from_secs(60));

        backend.start().await.unwrap();
        queue_file(dir.path(), "a@x", "one.json", b"xxxx");
        settle(&backend).await;
        let (_, rx_before) = backend.transfer_counters();
        backend.stop().await.unwrap();

        backend.start().await.unwrap();
        queue_file(dir.path(), "a@x", "two.json", b"yyyy");
        settle(&backend).await;
        let (_, rx_after) = backend.transfer_counters();
        assert!(rx_after >= rx_before);
        assert_eq!(rx_after, 8);
        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn files_are_counted_once() {
        let dir = tempdir().unwrap();
        let backend =
            EmbeddedBackend::with_interval(dir.path().to_path_buf(), "a@x", Duration::from_secs(60));
        backend.start().await.unwrap();

        queue_file(dir.path(), "a@x", "msg.json", b"abcdef");
        settle(&backend).await;
        settle(&backend).await;

        let (_, rx) = backend.transfer_counters();
        assert_eq!(rx, 6);
        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn websocket_flag_tracks_lifecycle() {
        let dir = tempdir().unwrap();
        let backend = EmbeddedBackend::new(dir.path().to_path_buf(), "a@x");
        assert!(!backend.websocket_connected().await);
        backend.start().await.unwrap();
        assert!(backend.websocket_connected().await);
        backend.stop().await.unwrap();
        assert!(!backend.websocket_connected().await);
    }

    #[tokio::test]
    async fn keep_markers_are_ignored() {
        let dir = tempdir().unwrap();
        let backend =
            EmbeddedBackend::with_interval(dir.path().to_path_buf(), "a@x", Duration::from_secs(60));
        backend.start().await.unwrap();

        let rpc = dir.path().join("datasites/a@x/app_data/biovault/rpc/message");
        std::fs::create_dir_all(&rpc).unwrap();
        std::fs::write(rpc.join(".syftkeep"), b"").unwrap();
        settle(&backend).await;

        assert_eq!(backend.transfer_counters(), (0, 0));
        backend.stop().await.unwrap();
    }
}
