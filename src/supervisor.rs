use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::bridge::{self, BridgeHandles, BridgeStartError};
use crate::config::EnvConfig;
use crate::core::CoreServices;

/// Requests handlers can make of the supervisor.
#[derive(Debug, Clone)]
pub enum ControlMsg {
    Shutdown,
    SwitchProfile(String),
    RestartServices,
}

/// Cheap clonable sender into the supervisor loop. `noop` is for tests
/// and detached contexts where nobody is listening.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Option<mpsc::UnboundedSender<ControlMsg>>,
}

impl ControlHandle {
    pub fn new(tx: mpsc::UnboundedSender<ControlMsg>) -> Self {
        ControlHandle { tx: Some(tx) }
    }

    pub fn noop() -> Self {
        ControlHandle { tx: None }
    }

    pub fn send(&self, msg: ControlMsg) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(msg);
        }
    }
}

/// Auto-refresh cadence while a client is attached.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10);
/// How long in-flight handlers may drain at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

enum Epoch {
    Exit,
    Restart,
}

/// Top-level service loop. Each iteration is one service epoch: boot the
/// core, raise the bridge and the sync daemon, run timers until a control
/// message or Ctrl-C, tear everything down. A profile switch just starts
/// the next epoch against the new home.
///
/// Returns the process exit code: 0 clean, 2 port bind failure. Fatal
/// init errors bubble up as `Err` (exit code 1).
pub async fn run(env: EnvConfig, config_root: &Path) -> Result<i32> {
    loop {
        let core = CoreServices::boot(env.clone(), config_root)?;
        let registry = Arc::new(bridge::handlers::build_registry());
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let control = ControlHandle::new(control_tx);

        let params = core.bridge_params();
        let bridge_handles = if params.enabled {
            match bridge::start(core.clone(), registry.clone(), control.clone()).await {
                Ok(handles) => Some(handles),
                Err(e @ BridgeStartError::Bind { .. }) => {
                    tracing::error!(error = %e, "agent bridge could not bind");
                    return Ok(2);
                }
                Err(BridgeStartError::Other(e)) => return Err(e),
            }
        } else {
            tracing::info!("agent bridge disabled");
            None
        };

        if core.has_identity() {
            if let Err(e) = core.syftbox.start().await {
                tracing::warn!(error = %e, "sync daemon did not start; continuing without it");
            }
        }

        let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        refresh.tick().await; // first tick fires immediately; consume it

        let next = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                    break Epoch::Exit;
                }
                msg = control_rx.recv() => match msg {
                    None | Some(ControlMsg::Shutdown) => break Epoch::Exit,
                    Some(ControlMsg::SwitchProfile(profile_id)) => {
                        match core.profiles.switch(&profile_id) {
                            Ok(profile) => {
                                tracing::info!(email = %profile.email, "switching profile");
                                break Epoch::Restart;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "profile switch rejected");
                            }
                        }
                    }
                    Some(ControlMsg::RestartServices) => break Epoch::Restart,
                },
                _ = refresh.tick() => {
                    let attached = bridge_handles
                        .as_ref()
                        .map(|b| b.state.attached.load(std::sync::atomic::Ordering::SeqCst))
                        .unwrap_or(0);
                    if attached > 0 {
                        refresh_once(&core).await;
                    }
                }
            }
        };

        teardown(&core, bridge_handles).await;
        match next {
            Epoch::Exit => return Ok(0),
            Epoch::Restart => continue,
        }
    }
}

/// One auto-refresh pass: drain the delivery queue and fold session
/// responses into pending sessions.
pub async fn refresh_once(core: &CoreServices) {
    let Ok(identity) = core.identity() else {
        return;
    };
    if let Err(e) = identity.messages.deliver_incoming().await {
        tracing::warn!(error = %e, "message refresh failed");
    }
    if let Err(e) = identity.sessions.apply_responses() {
        tracing::warn!(error = %e, "session refresh failed");
    }
}

async fn teardown(core: &CoreServices, bridge_handles: Option<BridgeHandles>) {
    if let Some(handles) = bridge_handles {
        handles.shutdown(SHUTDOWN_GRACE).await;
    }
    if let Err(e) = core.syftbox.stop().await {
        tracing::warn!(error = %e, "sync daemon stop failed");
    }
    core.jupyter.stop_all().await;
    core.audit.flush().await;
    tracing::info!("services stopped");
}
