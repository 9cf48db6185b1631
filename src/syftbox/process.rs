use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::config::SyftboxBackendKind;
use crate::error::{CoreError, CoreResult};

use super::queue::{QueueEntry, QueueStatus};
use super::{BackendInfo, SyftboxConfig, SyncBackend};

/// Default local control API of the external daemon.
const DEFAULT_CLIENT_URL: &str = "http://127.0.0.1:7938";

/// How long a TERM'd daemon gets before KILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Supervises the external `syftbox` daemon as a child process. Queue and
/// runtime telemetry come from the daemon's local control API; the child
/// handle is exclusive to this backend.
pub struct ProcessBackend {
    config: SyftboxConfig,
    client_url: String,
    child: Mutex<Option<Child>>,
    http: reqwest::Client,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

/// `GET /v1/status` response (external contract).
#[derive(Debug, Default, Deserialize)]
struct DaemonStatus {
    #[serde(default)]
    websocket: WebsocketStatus,
    #[serde(default)]
    tx_bytes: u64,
    #[serde(default)]
    rx_bytes: u64,
}

#[derive(Debug, Default, Deserialize)]
struct WebsocketStatus {
    #[serde(default)]
    connected: bool,
}

/// `GET /v1/sync/queue` response (external contract).
#[derive(Debug, Default, Deserialize)]
struct DaemonQueue {
    #[serde(default)]
    files: Vec<QueueEntry>,
}

impl ProcessBackend {
    pub fn new(config: SyftboxConfig) -> Self {
        ProcessBackend {
            client_url: std::env::var("SYFTBOX_CLIENT_URL")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_CLIENT_URL.to_string()),
            config,
            child: Mutex::new(None),
            http: reqwest::Client::new(),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
        }
    }

    async fn fetch_status(&self) -> CoreResult<DaemonStatus> {
        let url = format!("{}/v1/status", self.client_url);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| CoreError::DaemonUnavailable(format!("{url}: {e}")))?;
        let status: DaemonStatus = response
            .json()
            .await
            .map_err(|e| CoreError::DaemonUnavailable(format!("{url}: {e}")))?;
        // Counters only move forward even if the daemon restarts below us.
        self.tx_bytes.fetch_max(status.tx_bytes, Ordering::SeqCst);
        self.rx_bytes.fetch_max(status.rx_bytes, Ordering::SeqCst);
        Ok(status)
    }
}

#[async_trait::async_trait]
impl SyncBackend for ProcessBackend {
    fn kind(&self) -> SyftboxBackendKind {
        SyftboxBackendKind::Process
    }

    async fn start(&self) -> CoreResult<BackendInfo> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait()?.is_none() {
                return Ok(BackendInfo {
                    client_url: Some(self.client_url.clone()),
                    pid: child.id(),
                });
            }
            *guard = None;
        }

        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("daemon")
            .arg("--config")
            .arg(&self.config.config_path)
            .arg("--data-dir")
            .arg(&self.config.data_dir);
        if let Some(server) = &self.config.server_url {
            cmd.arg("--server").arg(server);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            CoreError::DaemonUnavailable(format!("failed to spawn {}: {e}", self.config.binary))
        })?;
        let pid = child.id();

        // Forward daemon output into our log.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(stdout).lines());
                while let Some(Ok(line)) = lines.next().await {
                    tracing::debug!(target: "syftbox", "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(stderr).lines());
                while let Some(Ok(line)) = lines.next().await {
                    tracing::warn!(target: "syftbox", "{line}");
                }
            });
        }

        // A daemon that dies within the first moments is a failed start,
        // not a running backend.
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Some(status) = child.try_wait()? {
            return Err(CoreError::DaemonUnavailable(format!(
                "{} exited immediately with {status}",
                self.config.binary
            )));
        }

        tracing::info!(pid = ?pid, binary = %self.config.binary, "syftbox daemon spawned");
        *guard = Some(child);
        Ok(BackendInfo { client_url: Some(self.client_url.clone()), pid })
    }

    async fn stop(&self) -> CoreResult<()> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            return Ok(());
        };

        // TERM first; escalate to KILL only after the grace period.
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "SIGTERM failed, killing");
            child.kill().await?;
            return Ok(());
        }

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid, %status, "syftbox daemon exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!(pid, "syftbox daemon ignored SIGTERM, killing");
                child.kill().await?;
                Ok(())
            }
        }
    }

    async fn trigger_sync(&self) -> CoreResult<()> {
        // Fire and forget; the daemon reports progress via its queue.
        let url = format!("{}/v1/sync/trigger", self.client_url);
        let http = self.http.clone();
        tokio::spawn(async move {
            if let Err(e) = http.post(&url).timeout(Duration::from_secs(10)).send().await {
                tracing::warn!(error = %e, "sync trigger failed");
            }
        });
        Ok(())
    }

    async fn queue_snapshot(&self) -> CoreResult<QueueStatus> {
        let url = format!("{}/v1/sync/queue", self.client_url);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| CoreError::DaemonUnavailable(format!("{url}: {e}")))?;
        let queue: DaemonQueue = response
            .json()
            .await
            .map_err(|e| CoreError::DaemonUnavailable(format!("{url}: {e}")))?;
        Ok(QueueStatus::from_entries(queue.files))
    }

    fn transfer_counters(&self) -> (u64, u64) {
        (self.tx_bytes.load(Ordering::SeqCst), self.rx_bytes.load(Ordering::SeqCst))
    }

    async fn websocket_connected(&self) -> bool {
        self.fetch_status().await.map(|s| s.websocket.connected).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    /// A stand-in daemon: a script that ignores its arguments and sleeps.
    fn fake_daemon(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("fake-syftbox");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn backend_with_binary(dir: &std::path::Path, binary: String) -> ProcessBackend {
        let mut config = SyftboxConfig::new(dir.to_path_buf());
        config.binary = binary;
        config.backend = SyftboxBackendKind::Process;
        ProcessBackend::new(config)
    }

    #[tokio::test]
    async fn start_and_graceful_stop() {
        let dir = tempdir().unwrap();
        let backend = backend_with_binary(dir.path(), fake_daemon(dir.path(), "sleep 30"));

        let info = backend.start().await.unwrap();
        assert!(info.pid.is_some());
        assert!(info.client_url.is_some());

        // Second start is a no-op while the child lives.
        let again = backend.start().await.unwrap();
        assert_eq!(again.pid, info.pid);

        backend.stop().await.unwrap();
        assert!(backend.child.lock().await.is_none());
    }

    #[tokio::test]
    async fn immediate_exit_is_a_start_failure() {
        let dir = tempdir().unwrap();
        let backend = backend_with_binary(dir.path(), fake_daemon(dir.path(), "exit 3"));
        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, CoreError::DaemonUnavailable(_)));
        assert!(err.to_string().contains("exited immediately"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_start_failure() {
        let dir = tempdir().unwrap();
        let backend = backend_with_binary(dir.path(), "/nonexistent/syftbox-binary".into());
        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, CoreError::DaemonUnavailable(_)));
    }

    #[tokio::test]
    async fn stop_without_child_is_a_noop() {
        let dir = tempdir().unwrap();
        let backend = backend_with_binary(dir.path(), "true".into());
        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn queue_without_daemon_is_unavailable() {
        let dir = tempdir().unwrap();
        let mut backend = backend_with_binary(dir.path(), "true".into());
        // Point at a port nothing listens on.
        backend.client_url = "http://127.0.0.1:1".into();
        let err = backend.queue_snapshot().await.unwrap_err();
        assert!(matches!(err, CoreError::DaemonUnavailable(_)));
        assert!(!backend.websocket_connected().await);
    }
}
