use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

use super::{read_json, write_json_atomic, Signer, VaultPaths};

/// A peer identity as seen from this profile. Discovered contacts were
/// observed on the sync tree; trusted contacts additionally have an
/// imported key bundle. `has_changed` flags a published bundle that no
/// longer matches the imported one.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Contact {
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_path: Option<PathBuf>,
    pub has_changed: bool,
    pub trusted: bool,
}

/// Published identity record (`public/crypto/did.json`). The key material
/// inside is opaque to the core; only the fingerprint is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityBundle {
    pub email: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub keys: serde_json::Value,
}

pub struct ContactStore {
    paths: VaultPaths,
}

impl ContactStore {
    pub fn new(paths: VaultPaths) -> Self {
        ContactStore { paths }
    }

    /// Publish this profile's identity bundle into its own datasite so
    /// peers can discover it after sync.
    pub fn publish_identity(&self, signer: &dyn Signer, keys: serde_json::Value) -> CoreResult<IdentityBundle> {
        let bundle = IdentityBundle {
            email: self.paths.owner().to_string(),
            fingerprint: signer.fingerprint(),
            created_at: Utc::now(),
            keys,
        };
        write_json_atomic(&self.paths.did_path(self.paths.owner()), &bundle)?;
        tracing::info!(email = %bundle.email, fingerprint = %bundle.fingerprint, "published identity");
        Ok(bundle)
    }

    /// Read a peer's published bundle from the local mirror, if present.
    pub fn published_bundle(&self, email: &str) -> CoreResult<Option<IdentityBundle>> {
        let path = self.paths.did_path(email);
        match read_json(&path) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Trust a peer by importing its bundle into the local vault.
    pub fn import_bundle(&self, peer: &str, bundle: &IdentityBundle) -> CoreResult<PathBuf> {
        let peer = peer.to_ascii_lowercase();
        if bundle.email != peer {
            return Err(CoreError::PreconditionFailed(format!(
                "bundle is for {}, not {peer}",
                bundle.email
            )));
        }
        let path = self.paths.bundle_path(&peer);
        write_json_atomic(&path, bundle)?;
        tracing::info!(peer = %peer, "imported contact bundle");
        Ok(path)
    }

    /// Import whatever the peer currently publishes.
    pub fn trust_published(&self, peer: &str) -> CoreResult<PathBuf> {
        let bundle = self
            .published_bundle(peer)?
            .ok_or_else(|| CoreError::NotFound(format!("published bundle for {peer}")))?;
        self.import_bundle(peer, &bundle)
    }

    /// Union of discovered datasites and imported bundles.
    pub fn list(&self) -> CoreResult<Vec<Contact>> {
        let mut contacts = Vec::new();
        let root = self.paths.datasites_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(contacts),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let identity = entry.file_name().to_string_lossy().to_string();
            if identity == self.paths.owner() || !identity.contains('@') {
                continue;
            }

            let published = self.published_bundle(&identity)?;
            let bundle_path = self.paths.bundle_path(&identity);
            let imported: Option<IdentityBundle> = if bundle_path.exists() {
                Some(read_json(&bundle_path)?)
            } else {
                None
            };

            // Not published and not imported: just a directory, skip it.
            if published.is_none() && imported.is_none() {
                continue;
            }

            let has_changed = match (&published, &imported) {
                (Some(p), Some(i)) => p.fingerprint != i.fingerprint,
                _ => false,
            };
            contacts.push(Contact {
                identity,
                fingerprint: published
                    .as_ref()
                    .or(imported.as_ref())
                    .map(|b| b.fingerprint.clone()),
                bundle_path: imported.is_some().then_some(bundle_path),
                has_changed,
                trusted: imported.is_some(),
            });
        }
        contacts.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(contacts)
    }
}
