use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// A named user identity with its own home directory, keys, and settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub home_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Root structure for `config.yaml` (multi-profile boot state).
#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfilesFile {
    #[serde(default)]
    active: Option<String>,
    #[serde(default)]
    profiles: Vec<Profile>,
}

/// Multi-profile boot state under the config root (`~/.biovault` unless
/// `BIOVAULT_CONFIG` overrides it). Exactly one profile is active per
/// process; all other state roots off the active profile's `home_path`.
pub struct ProfileStore {
    config_path: PathBuf,
    state: std::sync::Mutex<ProfilesFile>,
}

impl ProfileStore {
    pub fn open(config_root: &Path) -> CoreResult<Self> {
        let config_path = config_root.join("config.yaml");
        let state = match std::fs::read_to_string(&config_path) {
            Ok(contents) => serde_yaml::from_str(&contents).map_err(|e| {
                CoreError::Internal(format!("corrupt profile config {}: {e}", config_path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProfilesFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(ProfileStore {
            config_path,
            state: std::sync::Mutex::new(state),
        })
    }

    pub fn list(&self) -> Vec<Profile> {
        self.state.lock().unwrap().profiles.clone()
    }

    pub fn active(&self) -> Option<Profile> {
        let state = self.state.lock().unwrap();
        let id = state.active.as_ref()?;
        state.profiles.iter().find(|p| &p.id == id).cloned()
    }

    pub fn get(&self, profile_id: &str) -> Option<Profile> {
        self.state
            .lock()
            .unwrap()
            .profiles
            .iter()
            .find(|p| p.id == profile_id)
            .cloned()
    }

    /// Create a profile and its home directory skeleton. The first profile
    /// created becomes active.
    pub fn create(&self, email: &str, home_path: &Path) -> CoreResult<Profile> {
        let email = email.trim().to_ascii_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(CoreError::ParseParam {
                param: "email",
                detail: format!("not an email address: {email:?}"),
            });
        }

        let profile = Profile {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.clone(),
            home_path: home_path.to_path_buf(),
            created_at: Utc::now(),
        };

        {
            let mut state = self.state.lock().unwrap();
            if state.profiles.iter().any(|p| p.email == email) {
                return Err(CoreError::PreconditionFailed(format!(
                    "profile already exists for {email}"
                )));
            }
            state.profiles.push(profile.clone());
            if state.active.is_none() {
                state.active = Some(profile.id.clone());
            }
        }

        init_home_skeleton(home_path, &email)?;
        self.persist()?;
        Ok(profile)
    }

    /// Make a profile active. Callers are responsible for tearing down and
    /// restarting the services bound to the previous home.
    pub fn switch(&self, profile_id: &str) -> CoreResult<Profile> {
        let profile = {
            let mut state = self.state.lock().unwrap();
            let profile = state
                .profiles
                .iter()
                .find(|p| p.id == profile_id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("profile {profile_id}")))?;
            state.active = Some(profile.id.clone());
            profile
        };
        self.persist()?;
        Ok(profile)
    }

    /// Remove a profile record. The home directory is left on disk; wiping
    /// user data goes through the `reset` commands instead.
    pub fn delete(&self, profile_id: &str) -> CoreResult<Profile> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let idx = state
                .profiles
                .iter()
                .position(|p| p.id == profile_id)
                .ok_or_else(|| CoreError::NotFound(format!("profile {profile_id}")))?;
            let removed = state.profiles.remove(idx);
            if state.active.as_deref() == Some(profile_id) {
                state.active = None;
            }
            removed
        };
        self.persist()?;
        Ok(removed)
    }

    /// Persist `config.yaml` atomically (temp + rename).
    fn persist(&self) -> CoreResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = {
            let state = self.state.lock().unwrap();
            serde_yaml::to_string(&*state)
                .map_err(|e| CoreError::Internal(format!("failed to serialize profiles: {e}")))?
        };
        let tmp = self.config_path.with_extension("yaml.tmp");
        std::fs::write(&tmp, &yaml)?;
        std::fs::rename(&tmp, &self.config_path)?;
        Ok(())
    }
}

/// Create the per-profile directory layout an active profile expects.
fn init_home_skeleton(home: &Path, email: &str) -> CoreResult<()> {
    std::fs::create_dir_all(home.join("logs"))?;
    std::fs::create_dir_all(home.join("sessions"))?;
    std::fs::create_dir_all(
        home.join("datasites")
            .join(email)
            .join("app_data")
            .join("biovault"),
    )?;
    std::fs::create_dir_all(home.join(".biovault").join("vault").join("bundles"))?;
    Ok(())
}

/// Default config root: `~/.biovault`, unless overridden by the caller.
pub fn default_config_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".biovault")
}
