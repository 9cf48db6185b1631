use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};

/// What the bridge reports about a session's Jupyter runtime.
#[derive(Debug, Clone, Serialize)]
pub struct JupyterStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl JupyterStatus {
    fn stopped() -> Self {
        JupyterStatus { running: false, port: None, url: None, token: None }
    }
}

struct JupyterHandle {
    child: Child,
    port: u16,
    token: String,
}

impl JupyterHandle {
    fn status(&self) -> JupyterStatus {
        JupyterStatus {
            running: true,
            port: Some(self.port),
            url: Some(format!("http://127.0.0.1:{}/?token={}", self.port, self.token)),
            token: Some(self.token.clone()),
        }
    }
}

/// Launches and tracks one external Jupyter server per session. The
/// launcher itself (the `jupyter` binary) is an external collaborator;
/// this only holds the child handle and its connect info.
pub struct JupyterManager {
    binary: String,
    children: Mutex<HashMap<String, JupyterHandle>>,
}

const STOP_GRACE: Duration = Duration::from_secs(5);

impl JupyterManager {
    pub fn new() -> Self {
        Self::with_binary("jupyter")
    }

    pub fn with_binary(binary: &str) -> Self {
        JupyterManager {
            binary: binary.to_string(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Launch Jupyter scoped to the session directory. Launching an
    /// already-running session returns the existing handle.
    pub async fn launch(&self, session_id: &str, session_path: &Path) -> CoreResult<JupyterStatus> {
        let mut children = self.children.lock().await;

        if let Some(handle) = children.get_mut(session_id) {
            if handle.child.try_wait()?.is_none() {
                return Ok(handle.status());
            }
            children.remove(session_id);
        }

        let port = free_port()?;
        let token = uuid::Uuid::new_v4().simple().to_string();
        let runtime_dir = session_path.join(".jupyter");
        std::fs::create_dir_all(&runtime_dir)?;

        let child = Command::new(&self.binary)
            .arg("lab")
            .arg("--no-browser")
            .arg(format!("--port={port}"))
            .arg(format!("--ServerApp.token={token}"))
            .arg(format!("--notebook-dir={}", session_path.display()))
            .env("JUPYTER_DATA_DIR", &runtime_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CoreError::NotFound(format!("jupyter binary ({})", self.binary))
                } else {
                    e.into()
                }
            })?;

        tracing::info!(session_id = %session_id, port, "jupyter launched");
        let handle = JupyterHandle { child, port, token };
        let status = handle.status();
        children.insert(session_id.to_string(), handle);
        Ok(status)
    }

    pub async fn status(&self, session_id: &str) -> JupyterStatus {
        let mut children = self.children.lock().await;
        let Some(handle) = children.get_mut(session_id) else {
            return JupyterStatus::stopped();
        };
        if matches!(handle.child.try_wait(), Ok(None)) {
            handle.status()
        } else {
            children.remove(session_id);
            JupyterStatus::stopped()
        }
    }

    /// TERM then KILL, mirroring how the sync daemon is stopped.
    pub async fn stop(&self, session_id: &str) -> CoreResult<JupyterStatus> {
        let Some(mut handle) = self.children.lock().await.remove(session_id) else {
            return Ok(JupyterStatus::stopped());
        };
        if let Some(pid) = handle.child.id() {
            if signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                if tokio::time::timeout(STOP_GRACE, handle.child.wait()).await.is_ok() {
                    tracing::info!(session_id = %session_id, "jupyter stopped");
                    return Ok(JupyterStatus::stopped());
                }
            }
            handle.child.kill().await?;
        }
        Ok(JupyterStatus::stopped())
    }

    /// Stop and wipe the session's Jupyter state directory.
    pub async fn reset(&self, session_id: &str, session_path: &Path) -> CoreResult<JupyterStatus> {
        self.stop(session_id).await?;
        let runtime_dir = session_path.join(".jupyter");
        if runtime_dir.exists() {
            std::fs::remove_dir_all(&runtime_dir)?;
        }
        Ok(JupyterStatus::stopped())
    }

    /// Stop every tracked server (shutdown path).
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.children.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!(session_id = %id, error = %e, "failed to stop jupyter");
            }
        }
    }
}

impl Default for JupyterManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask the OS for a free loopback port.
fn free_port() -> CoreResult<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
