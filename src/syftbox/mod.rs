pub mod embedded;
pub mod process;
pub mod queue;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::SyftboxBackendKind;
use crate::error::{CoreError, CoreResult};

use queue::QueueStatus;

/// Daemon lifecycle as observed by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Runtime facts a backend reports once it is up.
#[derive(Debug, Clone, Default)]
pub struct BackendInfo {
    pub client_url: Option<String>,
    pub pid: Option<u32>,
}

/// What a sync backend must expose so the adapter can supervise it. The
/// embedded loop and the external daemon implement the same observable
/// surface; swapping backends never changes contracts upstream.
#[async_trait::async_trait]
pub trait SyncBackend: Send + Sync {
    fn kind(&self) -> SyftboxBackendKind;
    async fn start(&self) -> CoreResult<BackendInfo>;
    async fn stop(&self) -> CoreResult<()>;
    /// Kick a sync pass. Must return immediately; progress is observable
    /// through the queue.
    async fn trigger_sync(&self) -> CoreResult<()>;
    async fn queue_snapshot(&self) -> CoreResult<QueueStatus>;
    /// Cumulative transfer counters, monotonic within one running interval.
    fn transfer_counters(&self) -> (u64, u64);
    async fn websocket_connected(&self) -> bool;
}

/// Adapter configuration, resolved from env + settings at boot.
#[derive(Debug, Clone)]
pub struct SyftboxConfig {
    pub server_url: Option<String>,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub binary: String,
    pub backend: SyftboxBackendKind,
    pub max_start_attempts: u32,
}

impl SyftboxConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        SyftboxConfig {
            server_url: None,
            config_path: data_dir.join(".syftbox").join("config.json"),
            data_dir,
            binary: "syftbox".into(),
            backend: SyftboxBackendKind::Embedded,
            max_start_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyftboxStatus {
    pub running: bool,
    pub mode: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shape of the daemon's own `config.json`. Tokens are only probed for
/// presence, never surfaced.
#[derive(Debug, Default, Deserialize)]
struct DaemonConfigFile {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    server_url: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyftboxConfigInfo {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub is_authenticated: bool,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

struct Lifecycle {
    state: DaemonState,
    info: BackendInfo,
    error: Option<String>,
}

/// Supervises one sync backend. Owns the daemon lifecycle exclusively;
/// nothing else spawns or stops it. The adapter never touches message or
/// session files, it only drives the daemon that moves them.
pub struct SyftboxManager {
    config: SyftboxConfig,
    backend: std::sync::Arc<dyn SyncBackend>,
    lifecycle: RwLock<Lifecycle>,
    http: reqwest::Client,
}

impl SyftboxManager {
    pub fn new(config: SyftboxConfig, backend: std::sync::Arc<dyn SyncBackend>) -> Self {
        SyftboxManager {
            config,
            backend,
            lifecycle: RwLock::new(Lifecycle {
                state: DaemonState::Stopped,
                info: BackendInfo::default(),
                error: None,
            }),
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &SyftboxConfig {
        &self.config
    }

    pub async fn state(&self) -> DaemonState {
        self.lifecycle.read().await.state
    }

    /// Bring the daemon up, retrying with exponential backoff. A failed
    /// start parks the adapter in `error`; the next `start` resets it.
    pub async fn start(&self) -> CoreResult<()> {
        {
            let mut lifecycle = self.lifecycle.write().await;
            if matches!(lifecycle.state, DaemonState::Running | DaemonState::Starting) {
                return Ok(());
            }
            lifecycle.state = DaemonState::Starting;
            lifecycle.error = None;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.backend.start().await {
                Ok(info) => {
                    let mut lifecycle = self.lifecycle.write().await;
                    lifecycle.state = DaemonState::Running;
                    lifecycle.info = info;
                    tracing::info!(
                        backend = self.backend.kind().as_str(),
                        attempt,
                        "sync daemon running"
                    );
                    return Ok(());
                }
                Err(e) if attempt < self.config.max_start_attempts => {
                    let backoff = Duration::from_millis(250 * 2u64.pow(attempt - 1));
                    tracing::warn!(
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "sync daemon start failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    let mut lifecycle = self.lifecycle.write().await;
                    lifecycle.state = DaemonState::Error;
                    lifecycle.error = Some(e.to_string());
                    tracing::error!(error = %e, "sync daemon failed to start");
                    return Err(e);
                }
            }
        }
    }

    pub async fn stop(&self) -> CoreResult<()> {
        {
            let mut lifecycle = self.lifecycle.write().await;
            if matches!(lifecycle.state, DaemonState::Stopped | DaemonState::Stopping) {
                return Ok(());
            }
            lifecycle.state = DaemonState::Stopping;
        }

        let result = self.backend.stop().await;
        let mut lifecycle = self.lifecycle.write().await;
        match result {
            Ok(()) => {
                lifecycle.state = DaemonState::Stopped;
                lifecycle.info = BackendInfo::default();
                tracing::info!("sync daemon stopped");
                Ok(())
            }
            Err(e) => {
                lifecycle.state = DaemonState::Error;
                lifecycle.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn restart(&self) -> CoreResult<()> {
        self.stop().await?;
        self.start().await
    }

    pub async fn status(&self) -> SyftboxStatus {
        let (tx_bytes, rx_bytes) = self.backend.transfer_counters();
        let lifecycle = self.lifecycle.read().await;
        let mode = match lifecycle.state {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Stopping => "stopping",
            DaemonState::Error => "error",
        };
        SyftboxStatus {
            running: lifecycle.state == DaemonState::Running,
            mode: mode.to_string(),
            backend: self.backend.kind().as_str().to_string(),
            client_url: lifecycle.info.client_url.clone(),
            pid: lifecycle.info.pid,
            tx_bytes,
            rx_bytes,
            error: lifecycle.error.clone(),
        }
    }

    /// Non-blocking sync kick. Not retried; callers poll the queue.
    pub async fn trigger_sync(&self) -> CoreResult<()> {
        if self.state().await != DaemonState::Running {
            return Err(CoreError::DaemonUnavailable("sync daemon is not running".into()));
        }
        self.backend.trigger_sync().await
    }

    /// Aggregated queue + runtime telemetry, in the shape the UI polls.
    pub async fn queue_status(&self) -> CoreResult<serde_json::Value> {
        let sync = if self.state().await == DaemonState::Running {
            self.backend.queue_snapshot().await?
        } else {
            QueueStatus::default()
        };
        let connected = self.backend.websocket_connected().await;
        Ok(serde_json::json!({
            "sync": sync,
            "status": { "runtime": { "websocket": { "connected": connected } } },
        }))
    }

    pub fn config_info(&self) -> SyftboxConfigInfo {
        let parsed: DaemonConfigFile = std::fs::read_to_string(&self.config.config_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        let has_access_token = parsed.access_token.is_some_and(|t| !t.is_empty());
        let has_refresh_token = parsed.refresh_token.is_some_and(|t| !t.is_empty());
        SyftboxConfigInfo {
            config_path: self.config.config_path.clone(),
            data_dir: self.config.data_dir.clone(),
            is_authenticated: has_access_token,
            has_access_token,
            has_refresh_token,
            email: parsed.email,
            server_url: parsed.server_url.or_else(|| self.config.server_url.clone()),
        }
    }

    /// Opaque pass-through of the server's OTP handshake. The exchange
    /// itself belongs to the external server.
    pub async fn request_otp(&self, email: &str) -> CoreResult<serde_json::Value> {
        self.otp_call("request_email_code", serde_json::json!({ "email": email })).await
    }

    pub async fn submit_otp(&self, email: &str, code: &str) -> CoreResult<serde_json::Value> {
        self.otp_call(
            "verify_email_code",
            serde_json::json!({ "email": email, "code": code }),
        )
        .await
    }

    async fn otp_call(&self, endpoint: &str, body: serde_json::Value) -> CoreResult<serde_json::Value> {
        let server = self
            .config
            .server_url
            .as_ref()
            .ok_or_else(|| CoreError::DaemonUnavailable("no syftbox server configured".into()))?;
        let url = format!("{}/auth/{endpoint}", server.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| CoreError::DaemonUnavailable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::DaemonUnavailable(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| CoreError::DaemonUnavailable(format!("{url}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Backend that fails the first `failures` start attempts.
    struct FlakyBackend {
        failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl SyncBackend for FlakyBackend {
        fn kind(&self) -> SyftboxBackendKind {
            SyftboxBackendKind::Embedded
        }

        async fn start(&self) -> CoreResult<BackendInfo> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(CoreError::DaemonUnavailable("boot flake".into()))
            } else {
                Ok(BackendInfo { client_url: None, pid: Some(4242) })
            }
        }

        async fn stop(&self) -> CoreResult<()> {
            Ok(())
        }

        async fn trigger_sync(&self) -> CoreResult<()> {
            Ok(())
        }

        async fn queue_snapshot(&self) -> CoreResult<QueueStatus> {
            Ok(QueueStatus::default())
        }

        fn transfer_counters(&self) -> (u64, u64) {
            (0, 0)
        }

        async fn websocket_connected(&self) -> bool {
            true
        }
    }

    fn manager_with(failures: u32) -> SyftboxManager {
        let config = SyftboxConfig::new(std::env::temp_dir());
        SyftboxManager::new(
            config,
            Arc::new(FlakyBackend { failures, attempts: AtomicU32::new(0) }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start_retries_through_transient_failures() {
        let manager = manager_with(2);
        manager.start().await.unwrap();
        let status = manager.status().await;
        assert!(status.running);
        assert_eq!(status.mode, "running");
        assert_eq!(status.pid, Some(4242));
    }

    #[tokio::test(start_paused = true)]
    async fn start_gives_up_and_parks_in_error() {
        let manager = manager_with(10);
        assert!(manager.start().await.is_err());
        let status = manager.status().await;
        assert!(!status.running);
        assert_eq!(status.mode, "error");
        assert!(status.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn error_state_resets_on_next_start() {
        // 3 failures exhaust the first start's attempts; the 4th succeeds.
        let manager = manager_with(3);
        assert!(manager.start().await.is_err());
        manager.start().await.unwrap();
        assert_eq!(manager.state().await, DaemonState::Running);
    }

    #[tokio::test]
    async fn stop_start_cycle() {
        let manager = manager_with(0);
        manager.start().await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(manager.state().await, DaemonState::Stopped);
        manager.start().await.unwrap();
        assert_eq!(manager.state().await, DaemonState::Running);
    }

    #[tokio::test]
    async fn trigger_requires_running_daemon() {
        let manager = manager_with(0);
        let err = manager.trigger_sync().await.unwrap_err();
        assert!(matches!(err, CoreError::DaemonUnavailable(_)));
    }

    #[tokio::test]
    async fn config_info_reports_token_presence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyftboxConfig::new(dir.path().to_path_buf());
        config.config_path = dir.path().join("config.json");
        std::fs::write(
            &config.config_path,
            serde_json::json!({
                "email": "a@x",
                "server_url": "https://syftbox.example",
                "access_token": "at",
                "refresh_token": ""
            })
            .to_string(),
        )
        .unwrap();

        let manager = SyftboxManager::new(
            config,
            Arc::new(FlakyBackend { failures: 0, attempts: AtomicU32::new(0) }),
        );
        let info = manager.config_info();
        assert!(info.is_authenticated);
        assert!(info.has_access_token);
        assert!(!info.has_refresh_token);
        assert_eq!(info.email.as_deref(), Some("a@x"));
    }

    #[tokio::test]
    async fn queue_status_shape() {
        let manager = manager_with(0);
        manager.start().await.unwrap();
        let status = manager.queue_status().await.unwrap();
        assert!(status["sync"]["summary"].is_object());
        assert!(status["sync"]["files"].is_array());
        assert_eq!(status["status"]["runtime"]["websocket"]["connected"], true);
    }
}
