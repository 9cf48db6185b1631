pub mod contacts;
pub mod messages;
pub mod spaces;
pub mod threads;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreResult;

/// Marker file placed in otherwise-empty synced directories so the sync
/// layer does not prune them.
pub const KEEP_FILE: &str = ".syftkeep";

/// Path layout of the synced vault tree for one profile.
///
/// Everything under `datasites/<self>/...` is owned by this profile and
/// mirrored outward; `datasites/<peer>/...` are local mirrors of peers.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    home: PathBuf,
    data_dir: PathBuf,
    owner: String,
}

impl VaultPaths {
    pub fn new(home: &Path, data_dir: &Path, owner: &str) -> Self {
        VaultPaths {
            home: home.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            owner: owner.to_ascii_lowercase(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn datasites_root(&self) -> PathBuf {
        self.data_dir.join("datasites")
    }

    pub fn datasite(&self, email: &str) -> PathBuf {
        self.datasites_root().join(email.to_ascii_lowercase())
    }

    pub fn app_data(&self, email: &str) -> PathBuf {
        self.datasite(email).join("app_data").join("biovault")
    }

    /// Incoming message queue addressed to `email` (written by senders,
    /// drained by the recipient after sync).
    pub fn rpc_message_dir(&self, email: &str) -> PathBuf {
        self.app_data(email).join("rpc").join("message")
    }

    /// Canonical post-delivery message tree for the owner.
    pub fn inbox_root(&self) -> PathBuf {
        self.app_data(&self.owner).join("inbox")
    }

    pub fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.inbox_root().join(thread_id)
    }

    /// Local-only read-state sidecar; never synced to peers.
    pub fn read_state_path(&self) -> PathBuf {
        self.inbox_root().join(".read_state.json")
    }

    /// Published identity bundle of a datasite.
    pub fn did_path(&self, email: &str) -> PathBuf {
        self.datasite(email).join("public").join("crypto").join("did.json")
    }

    /// Imported (trusted) peer bundle.
    pub fn bundle_path(&self, peer: &str) -> PathBuf {
        self.home
            .join(".biovault")
            .join("vault")
            .join("bundles")
            .join(format!("{}.json", peer.to_ascii_lowercase()))
    }
}

/// Create a directory and drop a `.syftkeep` marker in it.
pub fn ensure_synced_dir(dir: &Path) -> CoreResult<()> {
    std::fs::create_dir_all(dir)?;
    let keep = dir.join(KEEP_FILE);
    if !keep.exists() {
        std::fs::write(&keep, b"")?;
    }
    Ok(())
}

/// Serialize JSON to `path` via temp file + rename so partial writes are
/// never observable by the sync layer.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| crate::error::CoreError::Internal(format!("serialize {}: {e}", path.display())))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> CoreResult<T> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| {
        crate::error::CoreError::Internal(format!("corrupt record {}: {e}", path.display()))
    })
}

/// Signature envelope wrapped around every on-disk message. The actual
/// cipher work lives in the external key library; in-core we only carry
/// the envelope it produces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignatureEnvelope {
    pub alg: String,
    pub key_fingerprint: String,
    pub signature: String,
}

/// Seam to the external key library.
pub trait Signer: Send + Sync {
    fn sign(&self, payload: &[u8]) -> SignatureEnvelope;
    fn fingerprint(&self) -> String;
}

/// Default in-core signer: a content digest envelope. Stands in for the
/// key library when no keystore is wired up (tests, fresh profiles).
pub struct DigestSigner {
    identity: String,
}

impl DigestSigner {
    pub fn new(identity: &str) -> Self {
        DigestSigner { identity: identity.to_ascii_lowercase() }
    }
}

impl Signer for DigestSigner {
    fn sign(&self, payload: &[u8]) -> SignatureEnvelope {
        SignatureEnvelope {
            alg: "sha256-digest".into(),
            key_fingerprint: self.fingerprint(),
            signature: hex_digest(payload),
        }
    }

    fn fingerprint(&self) -> String {
        hex_digest(self.identity.as_bytes())[..16].to_string()
    }
}

pub fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn paths_root_off_data_dir_and_lowercase_owner() {
        let paths = VaultPaths::new(Path::new("/home/a"), Path::new("/data"), "Alice@X");
        assert_eq!(paths.owner(), "alice@x");
        assert_eq!(
            paths.rpc_message_dir("Bob@X"),
            PathBuf::from("/data/datasites/bob@x/app_data/biovault/rpc/message")
        );
        assert_eq!(
            paths.inbox_root(),
            PathBuf::from("/data/datasites/alice@x/app_data/biovault/inbox")
        );
        assert_eq!(
            paths.bundle_path("Bob@X"),
            PathBuf::from("/home/a/.biovault/vault/bundles/bob@x.json")
        );
    }

    #[test]
    fn synced_dir_gets_keep_marker() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("rpc/message");
        ensure_synced_dir(&target).unwrap();
        assert!(target.join(KEEP_FILE).exists());
        // Idempotent.
        ensure_synced_dir(&target).unwrap();
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/record.json");
        write_json_atomic(&path, &serde_json::json!({"ok": true})).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn digest_signer_is_deterministic() {
        let signer = DigestSigner::new("A@X");
        let a = signer.sign(b"payload");
        let b = signer.sign(b"payload");
        assert_eq!(a, b);
        assert_eq!(a.alg, "sha256-digest");
        assert_eq!(signer.fingerprint().len(), 16);
        assert_ne!(signer.sign(b"other").signature, a.signature);
    }
}
