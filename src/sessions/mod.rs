pub mod jupyter;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::vault::messages::{
    MessageEvent, MessageStore, SendMessageRequest, SessionInvite, SessionInviteResponse,
};
use crate::vault::threads::ThreadScope;
use crate::vault::{read_json, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Owner,
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetRole {
    Shared,
    Private,
    Mock,
}

impl DatasetRole {
    pub fn parse(raw: &str) -> CoreResult<Self> {
        match raw {
            "shared" => Ok(DatasetRole::Shared),
            "private" => Ok(DatasetRole::Private),
            "mock" => Ok(DatasetRole::Mock),
            other => Err(CoreError::ParseParam {
                param: "role",
                detail: format!("expected shared|private|mock, got {other:?}"),
            }),
        }
    }
}

/// A dataset linked into a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetRef {
    pub id: String,
    pub session_id: String,
    pub dataset_public_url: String,
    pub dataset_owner: String,
    pub dataset_name: String,
    pub role: DatasetRole,
    pub created_at: DateTime<Utc>,
}

/// A bounded collaboration context with its own working directory.
/// Persisted as `sessions/<id>/session.json` under the profile home.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: SessionStatus,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    pub role: SessionRole,
    pub session_path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub datasets: Vec<DatasetRef>,
}

/// A pending invite as seen from the recipient's inbox.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionInvitation {
    pub session_id: String,
    pub session_name: String,
    pub requester: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub name: String,
    pub peer: Option<String>,
    pub description: Option<String>,
    /// Explicit id; used when re-materializing a known session.
    pub session_id: Option<String>,
}

/// Session lifecycle coordinator. Local records live under
/// `{home}/sessions/`; the invite/response handshake rides the message
/// store so it reaches the peer through the sync tree.
pub struct SessionStore {
    sessions_root: PathBuf,
    owner: String,
    messages: Arc<MessageStore>,
}

impl SessionStore {
    pub fn open(home: &Path, messages: Arc<MessageStore>) -> CoreResult<Self> {
        let sessions_root = home.join("sessions");
        std::fs::create_dir_all(&sessions_root)?;
        Ok(SessionStore {
            sessions_root,
            owner: messages.paths().owner().to_string(),
            messages,
        })
    }

    fn session_file(&self, session_id: &str) -> PathBuf {
        self.sessions_root.join(session_id).join("session.json")
    }

    fn persist(&self, session: &Session) -> CoreResult<()> {
        write_json_atomic(&self.session_file(&session.session_id), session)
    }

    pub fn get(&self, session_id: &str) -> CoreResult<Session> {
        let path = self.session_file(session_id);
        match read_json(&path) {
            Ok(session) => Ok(session),
            Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::NotFound(format!("session {session_id}")))
            }
            Err(e) => Err(e),
        }
    }

    pub fn list(&self) -> CoreResult<Vec<Session>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file = entry.path().join("session.json");
            if file.exists() {
                sessions.push(read_json(&file)?);
            }
        }
        sessions.sort_by(|a: &Session, b: &Session| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Create a session. With a peer the local state starts `pending` and a
    /// `session_invite` message goes out; solo sessions are active at once.
    /// Re-creating a known `session_id` returns the existing record.
    pub async fn create(&self, req: CreateSessionRequest) -> CoreResult<Session> {
        if req.name.trim().is_empty() {
            return Err(CoreError::MissingParam("name"));
        }
        let session_id = req.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if let Ok(existing) = self.get(&session_id) {
            return Ok(existing);
        }

        let peer = req.peer.map(|p| p.trim().to_ascii_lowercase()).filter(|p| !p.is_empty());
        let session_path = self.sessions_root.join(&session_id);
        std::fs::create_dir_all(session_path.join("files"))?;

        let session = Session {
            session_id: session_id.clone(),
            name: req.name.clone(),
            description: req.description.clone(),
            status: if peer.is_some() { SessionStatus::Pending } else { SessionStatus::Active },
            owner: self.owner.clone(),
            peer: peer.clone(),
            role: SessionRole::Owner,
            session_path,
            created_at: Utc::now(),
            datasets: Vec::new(),
        };
        self.persist(&session)?;

        if let Some(peer) = &peer {
            let invite = SessionInvite {
                session_id: session_id.clone(),
                session_name: req.name.clone(),
                requester: self.owner.clone(),
                description: req.description.clone(),
                created_at: session.created_at,
            };
            let mut metadata = serde_json::Map::new();
            metadata.insert("session_invite".into(), serde_json::to_value(&invite).unwrap());
            self.messages
                .send(SendMessageRequest {
                    to: vec![peer.clone()],
                    subject: Some(format!("Session invite: {}", req.name)),
                    body: format!("{} invited you to session \"{}\"", self.owner, req.name),
                    metadata,
                    ..Default::default()
                })
                .await?;
        }

        tracing::info!(session_id = %session_id, peer = ?peer, "session created");
        Ok(session)
    }

    /// Pending invites addressed to this profile: no local session record
    /// yet and no response sent.
    pub fn list_invitations(&self) -> CoreResult<Vec<SessionInvitation>> {
        let mut invitations = Vec::new();
        let responded = self.responded_session_ids()?;
        for thread in self.messages.list_threads(&ThreadScope::All)? {
            for message in self.messages.thread_messages(&thread.thread_id)? {
                let Ok(Some(MessageEvent::SessionInvite(invite))) = message.event() else {
                    continue;
                };
                if invite.requester == self.owner
                    || responded.contains(&invite.session_id)
                    || self.get(&invite.session_id).is_ok()
                {
                    continue;
                }
                invitations.push(SessionInvitation {
                    session_id: invite.session_id,
                    session_name: invite.session_name,
                    requester: invite.requester,
                    description: invite.description,
                    created_at: invite.created_at,
                });
            }
        }
        invitations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        invitations.dedup_by(|a, b| a.session_id == b.session_id);
        Ok(invitations)
    }

    /// Session ids this profile already answered (either way).
    fn responded_session_ids(&self) -> CoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for thread in self.messages.list_threads(&ThreadScope::All)? {
            for message in self.messages.thread_messages(&thread.thread_id)? {
                if let Ok(Some(MessageEvent::SessionInviteResponse(resp))) = message.event() {
                    if resp.responder == self.owner {
                        ids.push(resp.session_id);
                    }
                }
            }
        }
        Ok(ids)
    }

    fn find_invite(&self, session_id: &str) -> CoreResult<SessionInvite> {
        for thread in self.messages.list_threads(&ThreadScope::All)? {
            for message in self.messages.thread_messages(&thread.thread_id)? {
                if let Ok(Some(MessageEvent::SessionInvite(invite))) = message.event() {
                    if invite.session_id == session_id {
                        return Ok(invite);
                    }
                }
            }
        }
        Err(CoreError::NotFound(format!("session invitation {session_id}")))
    }

    async fn send_response(&self, invite: &SessionInvite, accepted: bool, reason: Option<String>) -> CoreResult<()> {
        let response = SessionInviteResponse {
            session_id: invite.session_id.clone(),
            accepted,
            responder: self.owner.clone(),
            reason,
        };
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "session_invite_response".into(),
            serde_json::to_value(&response).unwrap(),
        );
        self.messages
            .send(SendMessageRequest {
                to: vec![invite.requester.clone()],
                body: if accepted {
                    format!("{} accepted \"{}\"", self.owner, invite.session_name)
                } else {
                    format!("{} declined \"{}\"", self.owner, invite.session_name)
                },
                metadata,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// Accept an invitation: answers the requester and materializes an
    /// active peer-side session. Accepting twice returns the same session;
    /// accepting after a rejection is a precondition failure.
    pub async fn accept_invitation(&self, session_id: &str) -> CoreResult<Session> {
        if let Ok(existing) = self.get(session_id) {
            return match existing.status {
                SessionStatus::Active | SessionStatus::Pending => Ok(existing),
                SessionStatus::Closed => Err(CoreError::PreconditionFailed(format!(
                    "session {session_id} was already rejected or closed"
                ))),
            };
        }

        let invite = self.find_invite(session_id)?;
        self.send_response(&invite, true, None).await?;

        let session_path = self.sessions_root.join(session_id);
        std::fs::create_dir_all(session_path.join("files"))?;
        let session = Session {
            session_id: session_id.to_string(),
            name: invite.session_name.clone(),
            description: invite.description.clone(),
            status: SessionStatus::Active,
            owner: invite.requester.clone(),
            peer: Some(self.owner.clone()),
            role: SessionRole::Peer,
            session_path,
            created_at: Utc::now(),
            datasets: Vec::new(),
        };
        self.persist(&session)?;
        tracing::info!(session_id = %session_id, "session invitation accepted");
        Ok(session)
    }

    /// Reject an invitation. The closed record sticks around so a later
    /// accept fails instead of silently reviving the session.
    pub async fn reject_invitation(&self, session_id: &str, reason: Option<String>) -> CoreResult<()> {
        if let Ok(existing) = self.get(session_id) {
            return match existing.status {
                SessionStatus::Closed => Ok(()),
                _ => Err(CoreError::PreconditionFailed(format!(
                    "session {session_id} was already accepted"
                ))),
            };
        }

        let invite = self.find_invite(session_id)?;
        self.send_response(&invite, false, reason).await?;

        let session_path = self.sessions_root.join(session_id);
        std::fs::create_dir_all(&session_path)?;
        let session = Session {
            session_id: session_id.to_string(),
            name: invite.session_name.clone(),
            description: invite.description.clone(),
            status: SessionStatus::Closed,
            owner: invite.requester.clone(),
            peer: Some(self.owner.clone()),
            role: SessionRole::Peer,
            session_path,
            created_at: Utc::now(),
            datasets: Vec::new(),
        };
        self.persist(&session)?;
        Ok(())
    }

    /// Fold `session_invite_response` messages into pending owner-side
    /// sessions. Called from the refresh path after a delivery scan.
    pub fn apply_responses(&self) -> CoreResult<usize> {
        let mut updated = 0usize;
        let pending: Vec<Session> = self
            .list()?
            .into_iter()
            .filter(|s| s.role == SessionRole::Owner && s.status == SessionStatus::Pending)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        for thread in self.messages.list_threads(&ThreadScope::All)? {
            for message in self.messages.thread_messages(&thread.thread_id)? {
                let Ok(Some(MessageEvent::SessionInviteResponse(resp))) = message.event() else {
                    continue;
                };
                let Some(session) = pending.iter().find(|s| s.session_id == resp.session_id) else {
                    continue;
                };
                if resp.responder == self.owner {
                    continue;
                }
                let mut session = session.clone();
                session.status = if resp.accepted { SessionStatus::Active } else { SessionStatus::Closed };
                self.persist(&session)?;
                updated += 1;
                tracing::info!(
                    session_id = %session.session_id,
                    accepted = resp.accepted,
                    "session invite answered"
                );
            }
        }
        Ok(updated)
    }

    /// Explicitly close an active session.
    pub fn close(&self, session_id: &str) -> CoreResult<Session> {
        let mut session = self.get(session_id)?;
        match session.status {
            SessionStatus::Active => {
                session.status = SessionStatus::Closed;
                self.persist(&session)?;
                Ok(session)
            }
            SessionStatus::Closed => Ok(session),
            SessionStatus::Pending => Err(CoreError::PreconditionFailed(format!(
                "session {session_id} is still pending"
            ))),
        }
    }

    // --- linked datasets ---

    pub fn list_datasets(&self, session_id: &str) -> CoreResult<Vec<DatasetRef>> {
        Ok(self.get(session_id)?.datasets)
    }

    /// Link a dataset by public URL. Linking a URL twice returns the
    /// existing reference.
    pub fn add_dataset(
        &self,
        session_id: &str,
        dataset_url: &str,
        role: DatasetRole,
        dataset_owner: Option<String>,
        dataset_name: Option<String>,
    ) -> CoreResult<DatasetRef> {
        let mut session = self.get(session_id)?;
        if session.status == SessionStatus::Closed {
            return Err(CoreError::PreconditionFailed(format!(
                "session {session_id} is closed"
            )));
        }
        if let Some(existing) = session.datasets.iter().find(|d| d.dataset_public_url == dataset_url) {
            return Ok(existing.clone());
        }

        let name = dataset_name.unwrap_or_else(|| {
            dataset_url.trim_end_matches('/').rsplit('/').next().unwrap_or(dataset_url).to_string()
        });
        let dataset = DatasetRef {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            dataset_public_url: dataset_url.to_string(),
            dataset_owner: dataset_owner.unwrap_or_default(),
            dataset_name: name,
            role,
            created_at: Utc::now(),
        };
        session.datasets.push(dataset.clone());
        self.persist(&session)?;
        Ok(dataset)
    }

    pub fn remove_dataset(&self, session_id: &str, dataset_url: &str) -> CoreResult<bool> {
        let mut session = self.get(session_id)?;
        let before = session.datasets.len();
        session.datasets.retain(|d| d.dataset_public_url != dataset_url);
        let removed = session.datasets.len() != before;
        if removed {
            self.persist(&session)?;
        }
        Ok(removed)
    }

    /// Copy files into the session working directory; returns the
    /// destinations.
    pub fn add_files(&self, session_id: &str, file_paths: &[PathBuf]) -> CoreResult<Vec<PathBuf>> {
        let session = self.get(session_id)?;
        if session.status == SessionStatus::Closed {
            return Err(CoreError::PreconditionFailed(format!(
                "session {session_id} is closed"
            )));
        }
        let files_dir = session.session_path.join("files");
        std::fs::create_dir_all(&files_dir)?;

        let mut destinations = Vec::with_capacity(file_paths.len());
        for source in file_paths {
            let name = source
                .file_name()
                .ok_or_else(|| CoreError::ParseParam {
                    param: "file_paths",
                    detail: format!("no file name in {}", source.display()),
                })?;
            let dest = files_dir.join(name);
            std::fs::copy(source, &dest)?;
            destinations.push(dest);
        }
        tracing::info!(session_id = %session_id, count = destinations.len(), "files added to session");
        Ok(destinations)
    }

    /// Reveal the session folder via the OS shell (external collaborator).
    pub fn open_folder(&self, session_id: &str) -> CoreResult<PathBuf> {
        let session = self.get(session_id)?;
        let opener = if cfg!(target_os = "macos") { "open" } else { "xdg-open" };
        // Fire and forget; a headless host without an opener is fine.
        let _ = std::process::Command::new(opener)
            .arg(&session.session_path)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        Ok(session.session_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{DigestSigner, VaultPaths};
    use tempfile::tempdir;

    struct Peer {
        store: SessionStore,
        messages: Arc<MessageStore>,
    }

    fn peer(dir: &Path, email: &str) -> Peer {
        let paths = VaultPaths::new(dir, dir, email);
        let messages = Arc::new(MessageStore::open(paths, Arc::new(DigestSigner::new(email))).unwrap());
        // Per-profile session roots, mirroring separate homes.
        let home = dir.join(format!("home-{email}"));
        std::fs::create_dir_all(&home).unwrap();
        Peer {
            store: SessionStore::open(&home, messages.clone()).unwrap(),
            messages,
        }
    }

    #[tokio::test]
    async fn solo_session_is_active_immediately() {
        let dir = tempdir().unwrap();
        let alice = peer(dir.path(), "a@x");
        let session = alice
            .store
            .create(CreateSessionRequest { name: "Solo".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.role, SessionRole::Owner);
        assert!(session.session_path.join("files").is_dir());
    }

    #[tokio::test]
    async fn invite_roundtrip_activates_both_sides() {
        let dir = tempdir().unwrap();
        let alice = peer(dir.path(), "a@x");
        let bob = peer(dir.path(), "b@x");

        let session = alice
            .store
            .create(CreateSessionRequest {
                name: "S".into(),
                peer: Some("b@x".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        // Invite arrives at bob.
        bob.messages.deliver_incoming().await.unwrap();
        let invitations = bob.store.list_invitations().unwrap();
        assert_eq!(invitations.len(), 1);
        assert_eq!(invitations[0].session_id, session.session_id);
        assert_eq!(invitations[0].requester, "a@x");

        // Bob accepts; his side is active and the invite is consumed.
        let accepted = bob.store.accept_invitation(&session.session_id).await.unwrap();
        assert_eq!(accepted.status, SessionStatus::Active);
        assert_eq!(accepted.role, SessionRole::Peer);
        assert!(bob.store.list_invitations().unwrap().is_empty());

        // Response flows back; alice's side becomes active.
        alice.messages.deliver_incoming().await.unwrap();
        assert_eq!(alice.store.apply_responses().unwrap(), 1);
        assert_eq!(
            alice.store.get(&session.session_id).unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn accept_is_idempotent_and_reject_is_final() {
        let dir = tempdir().unwrap();
        let alice = peer(dir.path(), "a@x");
        let bob = peer(dir.path(), "b@x");

        let s1 = alice
            .store
            .create(CreateSessionRequest {
                name: "first".into(),
                peer: Some("b@x".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let s2 = alice
            .store
            .create(CreateSessionRequest {
                name: "second".into(),
                peer: Some("b@x".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        bob.messages.deliver_incoming().await.unwrap();

        // accept(accept(x)) returns the same session.
        let once = bob.store.accept_invitation(&s1.session_id).await.unwrap();
        let twice = bob.store.accept_invitation(&s1.session_id).await.unwrap();
        assert_eq!(once.session_id, twice.session_id);
        assert_eq!(twice.status, SessionStatus::Active);

        // accept(reject(y)) is a precondition failure.
        bob.store.reject_invitation(&s2.session_id, Some("busy".into())).await.unwrap();
        let err = bob.store.accept_invitation(&s2.session_id).await.unwrap_err();
        assert!(matches!(err, CoreError::PreconditionFailed(_)));

        // The rejection reaches alice as a closed session.
        alice.messages.deliver_incoming().await.unwrap();
        alice.store.apply_responses().unwrap();
        assert_eq!(alice.store.get(&s2.session_id).unwrap().status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn create_with_known_id_returns_existing() {
        let dir = tempdir().unwrap();
        let alice = peer(dir.path(), "a@x");
        let first = alice
            .store
            .create(CreateSessionRequest { name: "once".into(), ..Default::default() })
            .await
            .unwrap();
        let again = alice
            .store
            .create(CreateSessionRequest {
                name: "different name".into(),
                session_id: Some(first.session_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(again.name, "once");
        assert_eq!(alice.store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dataset_add_remove_restores_original_list() {
        let dir = tempdir().unwrap();
        let alice = peer(dir.path(), "a@x");
        let session = alice
            .store
            .create(CreateSessionRequest { name: "data".into(), ..Default::default() })
            .await
            .unwrap();

        let original = alice.store.list_datasets(&session.session_id).unwrap();
        let url = "syft://b@x/public/datasets/genomes";
        let linked = alice
            .store
            .add_dataset(&session.session_id, url, DatasetRole::Shared, Some("b@x".into()), None)
            .unwrap();
        assert_eq!(linked.dataset_name, "genomes");

        // Linking the same URL again returns the existing reference.
        let dup = alice
            .store
            .add_dataset(&session.session_id, url, DatasetRole::Mock, None, None)
            .unwrap();
        assert_eq!(dup.id, linked.id);
        assert_eq!(alice.store.list_datasets(&session.session_id).unwrap().len(), 1);

        assert!(alice.store.remove_dataset(&session.session_id, url).unwrap());
        assert_eq!(alice.store.list_datasets(&session.session_id).unwrap(), original);
        assert!(!alice.store.remove_dataset(&session.session_id, url).unwrap());
    }

    #[tokio::test]
    async fn close_transitions() {
        let dir = tempdir().unwrap();
        let alice = peer(dir.path(), "a@x");
        let solo = alice
            .store
            .create(CreateSessionRequest { name: "solo".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(alice.store.close(&solo.session_id).unwrap().status, SessionStatus::Closed);
        // Closing twice is fine; a closed session stays closed.
        assert_eq!(alice.store.close(&solo.session_id).unwrap().status, SessionStatus::Closed);

        let pending = alice
            .store
            .create(CreateSessionRequest {
                name: "waiting".into(),
                peer: Some("b@x".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(matches!(
            alice.store.close(&pending.session_id).unwrap_err(),
            CoreError::PreconditionFailed(_)
        ));
    }

    #[tokio::test]
    async fn add_files_copies_into_session() {
        let dir = tempdir().unwrap();
        let alice = peer(dir.path(), "a@x");
        let session = alice
            .store
            .create(CreateSessionRequest { name: "files".into(), ..Default::default() })
            .await
            .unwrap();

        let source = dir.path().join("notes.txt");
        std::fs::write(&source, b"observations").unwrap();
        let copied = alice.store.add_files(&session.session_id, &[source.clone()]).unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(std::fs::read(&copied[0]).unwrap(), b"observations");
        // Source untouched.
        assert!(source.exists());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dir = tempdir().unwrap();
        let alice = peer(dir.path(), "a@x");
        assert!(matches!(alice.store.get("ghost"), Err(CoreError::NotFound(_))));
        assert!(matches!(
            alice.store.accept_invitation("ghost").await,
            Err(CoreError::NotFound(_))
        ));
    }
}
