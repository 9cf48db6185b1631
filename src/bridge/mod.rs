pub mod args;
pub mod events;
pub mod handlers;
pub mod http;
pub mod registry;
pub mod ws;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::audit::AuditEntry;
use crate::core::CoreServices;
use crate::error::{CoreError, CoreResult};
use crate::supervisor::ControlHandle;

use events::EventSink;
use registry::{CommandContext, CommandRegistry};

/// Shared state behind both transports.
#[derive(Clone)]
pub struct BridgeState {
    pub core: Arc<CoreServices>,
    pub registry: Arc<CommandRegistry>,
    pub control: ControlHandle,
    /// Live WS connections; drives the supervisor's auto-refresh.
    pub attached: Arc<AtomicUsize>,
    /// Requests currently dispatched; drained on shutdown.
    pub in_flight: Arc<AtomicUsize>,
}

impl BridgeState {
    pub fn new(core: Arc<CoreServices>, registry: Arc<CommandRegistry>, control: ControlHandle) -> Self {
        BridgeState {
            core,
            registry,
            control,
            attached: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// The wire envelope. Anything outside these fields is an invalid request.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcRequest {
    pub id: Option<i64>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub token: Option<String>,
}

pub fn parse_request(text: &str) -> CoreResult<RpcRequest> {
    serde_json::from_str(text).map_err(|e| CoreError::InvalidRequest(e.to_string()))
}

/// Terminal frame for a request id: exactly one of these per id.
pub fn reply_frame(id: Value, result: &CoreResult<Value>) -> Value {
    match result {
        Ok(value) => serde_json::json!({ "id": id, "result": value }),
        Err(e) => serde_json::json!({ "id": id, "error": e.to_string() }),
    }
}

/// Full dispatch pipeline: auth → policy → handler (with timeout, panic
/// trap, and cancellation) → audit. Always produces exactly one audit
/// entry per request, success mirroring the terminal frame.
pub async fn dispatch(
    state: &BridgeState,
    id: i64,
    cmd: Option<String>,
    raw_args: Option<Value>,
    token: Option<String>,
    peer_addr: &str,
    sink: EventSink,
) -> CoreResult<Value> {
    let started = Instant::now();
    let args_size = raw_args.as_ref().map(|a| a.to_string().len()).unwrap_or(0);
    let cmd_name = cmd.clone().unwrap_or_default();

    state.in_flight.fetch_add(1, Ordering::SeqCst);
    let result = dispatch_inner(state, cmd, raw_args, token, sink).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    state.core.audit.record(AuditEntry {
        timestamp: Utc::now(),
        request_id: id,
        cmd: cmd_name,
        args_size,
        duration_ms: started.elapsed().as_millis() as u64,
        success: result.is_ok(),
        error: result.as_ref().err().map(|e| e.to_string()),
        peer_addr: peer_addr.to_string(),
    });
    result
}

async fn dispatch_inner(
    state: &BridgeState,
    cmd: Option<String>,
    raw_args: Option<Value>,
    token: Option<String>,
    sink: EventSink,
) -> CoreResult<Value> {
    let cmd = cmd
        .filter(|c| !c.is_empty())
        .ok_or_else(|| CoreError::InvalidRequest("missing cmd".into()))?;

    // Auth gates everything, including command lookup.
    let params = state.core.bridge_params();
    if let Some(expected) = &params.token {
        if token.as_deref() != Some(expected.as_str()) {
            return Err(CoreError::Unauthorized);
        }
    }

    let spec = state
        .registry
        .get(&cmd)
        .ok_or_else(|| CoreError::UnhandledCommand(cmd.clone()))?;

    let settings = state.core.settings.load();
    state.registry.check_policy(spec, &settings)?;

    let args = args::normalize(raw_args)?;
    let ctx = CommandContext {
        core: state.core.clone(),
        registry: state.registry.clone(),
        args,
        sink: sink.clone(),
        control: state.control.clone(),
    };

    // The handler runs in its own task so a panic is trapped at the join
    // boundary instead of tearing down the connection.
    let mut handle = tokio::spawn(spec.invoke(ctx));
    let timeout = spec.timeout;
    tokio::select! {
        joined = tokio::time::timeout(timeout, &mut handle) => match joined {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                tracing::error!(cmd = %cmd, error = %join_err, "handler panicked");
                Err(CoreError::Internal(format!("handler for {cmd} panicked")))
            }
            Err(_) => {
                handle.abort();
                tracing::warn!(cmd = %cmd, timeout_secs = timeout.as_secs(), "handler timed out");
                Err(CoreError::Timeout)
            }
        },
        _ = sink.cancelled() => {
            handle.abort();
            Err(CoreError::Cancelled)
        }
    }
}

/// Bound-and-running transports for one service epoch.
pub struct BridgeHandles {
    pub state: BridgeState,
    pub ws_addr: SocketAddr,
    pub http_addr: SocketAddr,
    ws_task: JoinHandle<()>,
    http_task: JoinHandle<()>,
}

impl std::fmt::Debug for BridgeHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandles")
            .field("ws_addr", &self.ws_addr)
            .field("http_addr", &self.http_addr)
            .finish_non_exhaustive()
    }
}

impl BridgeHandles {
    /// Stop accepting work. In-flight handlers get a grace period before
    /// the listeners are torn down.
    pub async fn shutdown(self, grace: std::time::Duration) {
        let deadline = Instant::now() + grace;
        while self.state.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let abandoned = self.state.in_flight.load(Ordering::SeqCst);
        if abandoned > 0 {
            tracing::warn!(abandoned, "abandoning in-flight handlers at shutdown");
        }
        self.ws_task.abort();
        self.http_task.abort();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeStartError {
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind { port: u16, source: std::io::Error },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Bind both transports on loopback and start serving. A port collision
/// surfaces as `Bind` so the process can exit with code 2.
pub async fn start(
    core: Arc<CoreServices>,
    registry: Arc<CommandRegistry>,
    control: ControlHandle,
) -> Result<BridgeHandles, BridgeStartError> {
    let params = core.bridge_params();
    let state = BridgeState::new(core, registry, control);

    let ws_listener = TcpListener::bind(("127.0.0.1", params.ws_port))
        .await
        .map_err(|source| BridgeStartError::Bind { port: params.ws_port, source })?;
    let http_listener = TcpListener::bind(("127.0.0.1", params.http_port))
        .await
        .map_err(|source| BridgeStartError::Bind { port: params.http_port, source })?;

    let ws_addr = ws_listener.local_addr().map_err(anyhow::Error::from)?;
    let http_addr = http_listener.local_addr().map_err(anyhow::Error::from)?;

    let ws_app = ws::router(state.clone());
    let http_app = http::router(state.clone());

    let ws_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            ws_listener,
            ws_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            tracing::error!(error = %e, "ws transport stopped");
        }
    });
    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            http_listener,
            http_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            tracing::error!(error = %e, "http transport stopped");
        }
    });

    tracing::info!(ws = %ws_addr, http = %http_addr, "agent bridge listening");
    Ok(BridgeHandles { state, ws_addr, http_addr, ws_task, http_task })
}
