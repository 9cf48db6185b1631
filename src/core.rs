use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::audit::AuditLog;
use crate::config::{EnvConfig, SyftboxBackendKind};
use crate::error::{CoreError, CoreResult};
use crate::profile::ProfileStore;
use crate::sessions::jupyter::JupyterManager;
use crate::sessions::SessionStore;
use crate::settings::SettingsStore;
use crate::syftbox::embedded::EmbeddedBackend;
use crate::syftbox::process::ProcessBackend;
use crate::syftbox::{SyftboxConfig, SyftboxManager, SyncBackend};
use crate::vault::contacts::ContactStore;
use crate::vault::messages::MessageStore;
use crate::vault::{DigestSigner, Signer, VaultPaths};

/// Services that only exist once a profile identity is known. Fresh
/// installs boot without them; onboarding commands bring them to life on
/// the next service restart.
pub struct VaultServices {
    pub email: String,
    pub signer: Arc<dyn Signer>,
    pub messages: Arc<MessageStore>,
    pub contacts: ContactStore,
    pub sessions: SessionStore,
}

impl std::fmt::Debug for VaultServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultServices").field("email", &self.email).finish_non_exhaustive()
    }
}

/// Everything a bridge handler can reach. One instance per service epoch:
/// a profile switch tears the whole thing down and boots a fresh one.
pub struct CoreServices {
    pub env: EnvConfig,
    pub config_root: PathBuf,
    pub home: PathBuf,
    pub data_dir: PathBuf,
    pub profiles: ProfileStore,
    pub settings: SettingsStore,
    pub audit: AuditLog,
    pub syftbox: SyftboxManager,
    pub jupyter: JupyterManager,
    pub http: reqwest::Client,
    pub started_at: Instant,
    vault: Option<VaultServices>,
}

/// Where the active profile's state lives: `BIOVAULT_HOME` wins, then the
/// active profile's `home_path`, then a default under the config root.
pub fn resolve_home(env: &EnvConfig, config_root: &Path) -> PathBuf {
    env.home
        .clone()
        .or_else(|| {
            ProfileStore::open(config_root)
                .ok()
                .and_then(|profiles| profiles.active())
                .map(|p| p.home_path)
        })
        .unwrap_or_else(|| config_root.join("default"))
}

impl CoreServices {
    pub fn boot(env: EnvConfig, config_root: &Path) -> Result<Arc<Self>> {
        let profiles = ProfileStore::open(config_root).context("failed to open profile store")?;
        let active = profiles.active();

        let home = env
            .home
            .clone()
            .or_else(|| active.as_ref().map(|p| p.home_path.clone()))
            .unwrap_or_else(|| config_root.join("default"));
        std::fs::create_dir_all(home.join("logs"))
            .with_context(|| format!("failed to create home at {}", home.display()))?;

        let settings_store = SettingsStore::open(&home).context("failed to load settings")?;
        let settings = settings_store.load();
        let audit = AuditLog::start(home.join("logs").join("agent_bridge_audit.jsonl"));

        let email = settings
            .email
            .clone()
            .or_else(|| active.as_ref().map(|p| p.email.clone()))
            .map(|e| e.to_ascii_lowercase());

        let data_dir = env.syftbox_data_dir.clone().unwrap_or_else(|| home.clone());

        let mut syftbox_config = SyftboxConfig::new(data_dir.clone());
        syftbox_config.server_url = env
            .syftbox_server_url
            .clone()
            .or_else(|| settings.syftbox_server_url.clone());
        if let Some(path) = &env.syftbox_config_path {
            syftbox_config.config_path = path.clone();
        }
        if let Some(binary) = &env.syftbox_binary {
            syftbox_config.binary = binary.clone();
        }
        syftbox_config.backend = env.syftbox_backend.unwrap_or(SyftboxBackendKind::Embedded);

        let backend: Arc<dyn SyncBackend> = match syftbox_config.backend {
            SyftboxBackendKind::Embedded => Arc::new(EmbeddedBackend::new(
                data_dir.clone(),
                email.as_deref().unwrap_or(""),
            )),
            SyftboxBackendKind::Process => Arc::new(ProcessBackend::new(syftbox_config.clone())),
        };
        let syftbox = SyftboxManager::new(syftbox_config, backend);

        let vault = match &email {
            Some(email) => {
                let paths = VaultPaths::new(&home, &data_dir, email);
                let signer: Arc<dyn Signer> = Arc::new(DigestSigner::new(email));
                let messages = Arc::new(
                    MessageStore::open(paths.clone(), signer.clone())
                        .context("failed to open message store")?,
                );
                let contacts = ContactStore::new(paths);
                let sessions = SessionStore::open(&home, messages.clone())
                    .context("failed to open session store")?;
                Some(VaultServices { email: email.clone(), signer, messages, contacts, sessions })
            }
            None => None,
        };

        tracing::info!(
            home = %home.display(),
            email = email.as_deref().unwrap_or("<onboarding>"),
            backend = syftbox.config().backend.as_str(),
            "core services booted"
        );

        Ok(Arc::new(CoreServices {
            env,
            config_root: config_root.to_path_buf(),
            home,
            data_dir,
            profiles,
            settings: settings_store,
            audit,
            syftbox,
            jupyter: JupyterManager::new(),
            http: reqwest::Client::new(),
            started_at: Instant::now(),
            vault,
        }))
    }

    /// Identity-bound services, or a precondition failure during
    /// onboarding.
    pub fn identity(&self) -> CoreResult<&VaultServices> {
        self.vault
            .as_ref()
            .ok_or_else(|| CoreError::PreconditionFailed("no active profile; complete onboarding first".into()))
    }

    pub fn has_identity(&self) -> bool {
        self.vault.is_some()
    }

    /// Effective bridge parameters after the env overrides are applied on
    /// top of persisted settings.
    pub fn bridge_params(&self) -> BridgeParams {
        let settings = self.settings.load();
        BridgeParams {
            enabled: self.env.bridge_enabled.unwrap_or(settings.agent_bridge_enabled),
            ws_port: self.env.bridge_port.unwrap_or(settings.agent_bridge_port),
            http_port: self.env.bridge_http_port.unwrap_or(settings.agent_bridge_http_port),
            token: self.env.bridge_token.clone().or(settings.agent_bridge_token),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeParams {
    pub enabled: bool,
    pub ws_port: u16,
    pub http_port: u16,
    pub token: Option<String>,
}
