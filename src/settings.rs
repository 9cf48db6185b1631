use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{CoreError, CoreResult};

/// Per-profile settings persisted as `{home}/settings.json`.
///
/// Field order is the on-disk order; load/save round-trips bit-identically
/// for any file this struct wrote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biovault_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syftbox_server_url: Option<String>,
    #[serde(default = "default_bridge_enabled")]
    pub agent_bridge_enabled: bool,
    #[serde(default = "default_ws_port")]
    pub agent_bridge_port: u16,
    #[serde(default = "default_http_port")]
    pub agent_bridge_http_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_bridge_token: Option<String>,
    #[serde(default)]
    pub agent_bridge_blocklist: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_api_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_model: Option<String>,
    #[serde(default)]
    pub autostart_enabled: bool,
}

fn default_bridge_enabled() -> bool {
    true
}

fn default_ws_port() -> u16 {
    crate::config::EnvConfig::DEFAULT_WS_PORT
}

fn default_http_port() -> u16 {
    crate::config::EnvConfig::DEFAULT_HTTP_PORT
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            email: None,
            biovault_path: None,
            syftbox_server_url: None,
            agent_bridge_enabled: default_bridge_enabled(),
            agent_bridge_port: default_ws_port(),
            agent_bridge_http_port: default_http_port(),
            agent_bridge_token: None,
            agent_bridge_blocklist: BTreeSet::new(),
            ai_api_url: None,
            ai_api_token: None,
            ai_model: None,
            autostart_enabled: false,
        }
    }
}

impl Settings {
    /// Port invariants: distinct, both in the unprivileged range.
    pub fn validate(&self) -> CoreResult<()> {
        if self.agent_bridge_port == self.agent_bridge_http_port {
            return Err(CoreError::PreconditionFailed(format!(
                "agent_bridge_port and agent_bridge_http_port must differ (both {})",
                self.agent_bridge_port
            )));
        }
        for (name, port) in [
            ("agent_bridge_port", self.agent_bridge_port),
            ("agent_bridge_http_port", self.agent_bridge_http_port),
        ] {
            if port < 1024 {
                return Err(CoreError::PreconditionFailed(format!(
                    "{name} must be in [1024, 65535], got {port}"
                )));
            }
        }
        Ok(())
    }

    /// Merge a patch of recognized keys into a copy of self. Unknown keys
    /// are rejected so agents can't silently grow the settings blob.
    pub fn apply_patch(&self, patch: &serde_json::Map<String, serde_json::Value>) -> CoreResult<Settings> {
        let mut value = serde_json::to_value(self).map_err(|e| CoreError::Internal(e.to_string()))?;
        let obj = value.as_object_mut().expect("settings serialize to object");
        for (key, v) in patch {
            if !Self::is_recognized_key(key) {
                return Err(CoreError::InvalidRequest(format!("unknown setting: {key}")));
            }
            if v.is_null() {
                obj.remove(key);
            } else {
                obj.insert(key.clone(), v.clone());
            }
        }
        let merged: Settings = serde_json::from_value(value)
            .map_err(|e| CoreError::ParseParam { param: "settings", detail: e.to_string() })?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn is_recognized_key(key: &str) -> bool {
        matches!(
            key,
            "email"
                | "biovault_path"
                | "syftbox_server_url"
                | "agent_bridge_enabled"
                | "agent_bridge_port"
                | "agent_bridge_http_port"
                | "agent_bridge_token"
                | "agent_bridge_blocklist"
                | "ai_api_url"
                | "ai_api_token"
                | "ai_model"
                | "autostart_enabled"
        )
    }
}

/// Advisory lock guarding the settings file against concurrent writers
/// from other processes. Created with O_EXCL; removed on drop.
struct SettingsLock {
    path: PathBuf,
}

impl SettingsLock {
    fn acquire(settings_path: &Path) -> CoreResult<Self> {
        let path = settings_path.with_extension("json.lock");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(SettingsLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() >= deadline {
                        return Err(CoreError::PreconditionFailed(format!(
                            "settings file is locked by another writer: {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for SettingsLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Settings store scoped to a single profile home. One writer at a time;
/// readers get cheap clones of the last loaded value via the watch channel.
pub struct SettingsStore {
    path: PathBuf,
    tx: watch::Sender<Settings>,
}

impl SettingsStore {
    /// Open the store, loading current settings (or defaults when the file
    /// is missing). A corrupt file is an error, not a silent reset.
    pub fn open(home: &Path) -> CoreResult<Self> {
        let path = home.join("settings.json");
        let current = Self::load_from(&path)?;
        let (tx, _) = watch::channel(current);
        Ok(SettingsStore { path, tx })
    }

    fn load_from(path: &Path) -> CoreResult<Settings> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                CoreError::Internal(format!("corrupt settings file {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings snapshot.
    pub fn load(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// Re-read from disk, replacing the in-memory snapshot.
    pub fn reload(&self) -> CoreResult<Settings> {
        let fresh = Self::load_from(&self.path)?;
        self.tx.send_replace(fresh.clone());
        Ok(fresh)
    }

    /// Validate and persist atomically (temp file + rename under the
    /// advisory lock), then notify watchers.
    pub fn save(&self, settings: &Settings) -> CoreResult<()> {
        settings.validate()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let _lock = SettingsLock::acquire(&self.path)?;
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| CoreError::Internal(format!("failed to serialize settings: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)?;

        self.tx.send_replace(settings.clone());
        Ok(())
    }

    /// Subscribe to settings changes.
    pub fn watch(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).unwrap();
        let settings = store.load();
        assert_eq!(settings, Settings::default());
        assert!(settings.agent_bridge_enabled);
        assert_eq!(settings.agent_bridge_port, 3333);
        assert_eq!(settings.agent_bridge_http_port, 3334);
    }

    #[test]
    fn save_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).unwrap();

        let mut settings = Settings::default();
        settings.email = Some("a@x".into());
        settings.agent_bridge_token = Some("tok-abc".into());
        settings.agent_bridge_blocklist.insert("reset_everything".into());
        store.save(&settings).unwrap();

        let reopened = SettingsStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load(), settings);

        // Saving the loaded value reproduces the same bytes.
        let before = std::fs::read(dir.path().join("settings.json")).unwrap();
        reopened.save(&reopened.load()).unwrap();
        let after = std::fs::read(dir.path().join("settings.json")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn corrupt_file_fails_loudly() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "{not json").unwrap();
        assert!(SettingsStore::open(dir.path()).is_err());
    }

    #[test]
    fn equal_ports_rejected() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).unwrap();
        let mut settings = Settings::default();
        settings.agent_bridge_http_port = settings.agent_bridge_port;
        let err = store.save(&settings).unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn privileged_port_rejected() {
        let mut settings = Settings::default();
        settings.agent_bridge_port = 80;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn save_notifies_watchers() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).unwrap();
        let rx = store.watch();

        let mut settings = Settings::default();
        settings.email = Some("b@x".into());
        store.save(&settings).unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().email.as_deref(), Some("b@x"));
    }

    #[test]
    fn patch_merges_recognized_keys() {
        let settings = Settings::default();
        let patch = serde_json::json!({
            "email": "c@x",
            "agent_bridge_port": 4000,
        });
        let merged = settings.apply_patch(patch.as_object().unwrap()).unwrap();
        assert_eq!(merged.email.as_deref(), Some("c@x"));
        assert_eq!(merged.agent_bridge_port, 4000);
        // Untouched fields keep their values.
        assert_eq!(merged.agent_bridge_http_port, 3334);
    }

    #[test]
    fn patch_rejects_unknown_key() {
        let settings = Settings::default();
        let patch = serde_json::json!({ "favorite_color": "green" });
        let err = settings.apply_patch(patch.as_object().unwrap()).unwrap_err();
        assert!(err.to_string().contains("unknown setting: favorite_color"));
    }

    #[test]
    fn patch_null_clears_optional() {
        let mut settings = Settings::default();
        settings.agent_bridge_token = Some("tok".into());
        let patch = serde_json::json!({ "agent_bridge_token": null });
        let merged = settings.apply_patch(patch.as_object().unwrap()).unwrap();
        assert!(merged.agent_bridge_token.is_none());
    }

    #[test]
    fn stale_lock_blocks_then_errors() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).unwrap();
        // Simulate another writer holding the lock.
        std::fs::write(dir.path().join("settings.json.lock"), b"").unwrap();
        let err = store.save(&Settings::default()).unwrap_err();
        assert!(err.to_string().contains("locked"));
    }
}
