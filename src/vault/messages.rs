use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};

use super::threads::{participant_signature, preview_of, ThreadScope, ThreadView};
use super::{ensure_synced_dir, read_json, write_json_atomic, SignatureEnvelope, Signer, VaultPaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

/// A single vault message. `thread_id` is always the participant
/// signature of `to ∪ {from}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// On-disk form: the message plus the envelope from the key library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: Message,
    pub envelope: SignatureEnvelope,
}

pub const EVENT_KEYS: [&str; 4] = [
    "session_invite",
    "session_invite_response",
    "flow_request",
    "flow_results",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInvite {
    pub session_id: String,
    pub session_name: String,
    pub requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInviteResponse {
    pub session_id: String,
    pub accepted: bool,
    pub responder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typed view over the single recognized event key of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageEvent {
    SessionInvite(SessionInvite),
    SessionInviteResponse(SessionInviteResponse),
    FlowRequest(serde_json::Value),
    FlowResults(serde_json::Value),
}

impl Message {
    /// Parse the typed event carried in `metadata`, if any. At most one
    /// event key may be present; more is a malformed message.
    pub fn event(&self) -> CoreResult<Option<MessageEvent>> {
        let present: Vec<&str> = EVENT_KEYS
            .iter()
            .copied()
            .filter(|k| self.metadata.contains_key(*k))
            .collect();
        match present.as_slice() {
            [] => Ok(None),
            [key] => {
                let value = self.metadata[*key].clone();
                let event = match *key {
                    "session_invite" => MessageEvent::SessionInvite(
                        serde_json::from_value(value).map_err(|e| CoreError::ParseParam {
                            param: "session_invite",
                            detail: e.to_string(),
                        })?,
                    ),
                    "session_invite_response" => MessageEvent::SessionInviteResponse(
                        serde_json::from_value(value).map_err(|e| CoreError::ParseParam {
                            param: "session_invite_response",
                            detail: e.to_string(),
                        })?,
                    ),
                    "flow_request" => MessageEvent::FlowRequest(value),
                    "flow_results" => MessageEvent::FlowResults(value),
                    _ => unreachable!(),
                };
                Ok(Some(event))
            }
            many => Err(CoreError::InvalidRequest(format!(
                "message carries {} event keys, at most one allowed",
                many.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendMessageRequest {
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub body: String,
    pub reply_to: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Explicit id for redelivery; normal sends leave this unset.
    pub id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReadState {
    #[serde(default)]
    read: BTreeSet<String>,
}

/// Outcome of a delivery scan over the owner's `rpc/message/` queue.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub new_messages: Vec<Message>,
    pub new_failed: usize,
}

/// Filesystem-backed message store rooted in the synced vault tree.
///
/// Writes for one thread are serialized by a per-thread mutex; reads are
/// plain directory snapshots.
pub struct MessageStore {
    paths: VaultPaths,
    signer: Arc<dyn Signer>,
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    read_state: std::sync::Mutex<ReadState>,
}

impl MessageStore {
    pub fn open(paths: VaultPaths, signer: Arc<dyn Signer>) -> CoreResult<Self> {
        ensure_synced_dir(&paths.rpc_message_dir(paths.owner()))?;
        std::fs::create_dir_all(paths.inbox_root())?;
        let read_state = match read_json::<ReadState>(&paths.read_state_path()) {
            Ok(state) => state,
            Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => ReadState::default(),
            Err(e) => return Err(e),
        };
        Ok(MessageStore {
            paths,
            signer,
            thread_locks: Mutex::new(HashMap::new()),
            read_state: std::sync::Mutex::new(read_state),
        })
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    async fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.thread_locks.lock().await;
        locks.entry(thread_id.to_string()).or_default().clone()
    }

    /// Build, persist, and queue a message for every recipient. Returns
    /// the stored record; `status` is `Failed` when any recipient write
    /// failed. Sending an id that is already stored is a no-op.
    pub async fn send(&self, req: SendMessageRequest) -> CoreResult<Message> {
        let owner = self.paths.owner().to_string();
        let recipients: BTreeSet<String> = req
            .to
            .iter()
            .map(|r| r.trim().to_ascii_lowercase())
            .filter(|r| !r.is_empty())
            .collect();
        if recipients.is_empty() {
            return Err(CoreError::MissingParam("to"));
        }

        let mut participants: Vec<String> = recipients.iter().cloned().collect();
        participants.push(owner.clone());
        let thread_id = participant_signature(&participants);

        let mut message = Message {
            id: req.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            from: owner.clone(),
            to: recipients.iter().cloned().collect(),
            subject: req.subject,
            body: req.body,
            created_at: Utc::now(),
            status: MessageStatus::Pending,
            thread_id: thread_id.clone(),
            reply_to: req.reply_to,
            metadata: req.metadata,
        };
        // Reject malformed event metadata before anything hits disk.
        message.event()?;

        let lock = self.thread_lock(&thread_id).await;
        let _guard = lock.lock().await;

        let own_path = self.paths.thread_dir(&thread_id).join(format!("{}.json", message.id));
        if own_path.exists() {
            return read_json::<SignedMessage>(&own_path).map(|signed| signed.message);
        }

        let mut failed = 0usize;
        for recipient in &recipients {
            if recipient == &owner {
                continue;
            }
            message.status = MessageStatus::Sent;
            if let Err(e) = self.write_signed(
                &self.paths.rpc_message_dir(recipient).join(format!("{}.json", message.id)),
                &message,
                true,
            ) {
                tracing::warn!(recipient = %recipient, error = %e, "failed to queue message");
                failed += 1;
            }
        }

        message.status = if failed > 0 { MessageStatus::Failed } else { MessageStatus::Sent };
        self.write_signed(&own_path, &message, false)?;
        self.mark_read(&[message.id.clone()])?;

        tracing::info!(
            message_id = %message.id,
            thread_id = %thread_id,
            recipients = recipients.len(),
            "message queued"
        );
        Ok(message)
    }

    fn write_signed(&self, path: &Path, message: &Message, synced_dir: bool) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            if synced_dir {
                ensure_synced_dir(parent)?;
            } else {
                std::fs::create_dir_all(parent)?;
            }
        }
        let payload = serde_json::to_vec(message)
            .map_err(|e| CoreError::Internal(format!("serialize message: {e}")))?;
        let signed = SignedMessage {
            message: message.clone(),
            envelope: self.signer.sign(&payload),
        };
        write_json_atomic(path, &signed)
    }

    /// Drain the owner's `rpc/message/` queue into the inbox. Re-delivery
    /// of an already-stored id removes the queue file without rewriting
    /// the record.
    pub async fn deliver_incoming(&self) -> CoreResult<DeliveryReport> {
        let queue_dir = self.paths.rpc_message_dir(self.paths.owner());
        let mut report = DeliveryReport::default();

        let entries = match std::fs::read_dir(&queue_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let mut signed: SignedMessage = match read_json(&path) {
                Ok(signed) => signed,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "undeliverable message");
                    let _ = std::fs::rename(&path, path.with_extension("json.failed"));
                    report.new_failed += 1;
                    continue;
                }
            };

            // The thread id is recomputed locally rather than trusted from
            // the sender.
            let mut participants = signed.message.to.clone();
            participants.push(signed.message.from.clone());
            let thread_id = participant_signature(&participants);
            signed.message.thread_id = thread_id.clone();

            let lock = self.thread_lock(&thread_id).await;
            let _guard = lock.lock().await;

            let dest = self.paths.thread_dir(&thread_id).join(format!("{}.json", signed.message.id));
            if !dest.exists() {
                // The sender's envelope is preserved; only the delivery
                // status changes.
                signed.message.status = MessageStatus::Delivered;
                write_json_atomic(&dest, &signed)?;
                report.new_messages.push(signed.message);
            }
            std::fs::remove_file(&path)?;
        }

        if !report.new_messages.is_empty() {
            tracing::info!(count = report.new_messages.len(), "delivered incoming messages");
        }
        Ok(report)
    }

    /// All messages of one thread, ordered by `created_at` with ties
    /// broken by id.
    pub fn thread_messages(&self, thread_id: &str) -> CoreResult<Vec<Message>> {
        let dir = self.paths.thread_dir(thread_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(format!("thread {thread_id}")));
            }
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with('.')) {
                continue;
            }
            let signed: SignedMessage = read_json(&path)?;
            messages.push(signed.message);
        }
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// Thread views over the whole inbox, newest activity first.
    pub fn list_threads(&self, scope: &ThreadScope) -> CoreResult<Vec<ThreadView>> {
        let root = self.paths.inbox_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let read = self.read_state.lock().unwrap().read.clone();
        let mut threads = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let thread_id = entry.file_name().to_string_lossy().to_string();
            if thread_id.starts_with('.') {
                continue;
            }
            let messages = self.thread_messages(&thread_id)?;
            let Some(view) = build_thread_view(&thread_id, &messages, &read) else {
                continue;
            };
            if scope.matches(&view) {
                threads.push(view);
            }
        }
        threads.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(threads)
    }

    pub fn mark_thread_read(&self, thread_id: &str) -> CoreResult<usize> {
        let ids: Vec<String> = self.thread_messages(thread_id)?.into_iter().map(|m| m.id).collect();
        let count = ids.len();
        self.mark_read(&ids)?;
        Ok(count)
    }

    fn mark_read(&self, ids: &[String]) -> CoreResult<()> {
        let snapshot = {
            let mut state = self.read_state.lock().unwrap();
            let before = state.read.len();
            state.read.extend(ids.iter().cloned());
            if state.read.len() == before {
                return Ok(());
            }
            ReadState { read: state.read.clone() }
        };
        write_json_atomic(&self.paths.read_state_path(), &snapshot)
    }

    /// Remove one message from the local view. Remote copies are untouched.
    pub async fn delete_message(&self, message_id: &str) -> CoreResult<bool> {
        for thread in self.list_threads(&ThreadScope::All)? {
            let path = self.paths.thread_dir(&thread.thread_id).join(format!("{message_id}.json"));
            if path.exists() {
                let lock = self.thread_lock(&thread.thread_id).await;
                let _guard = lock.lock().await;
                std::fs::remove_file(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop the local owner's view of a thread. No outgoing writes: every
    /// peer keeps its own copy.
    pub async fn delete_thread(&self, thread_id: &str) -> CoreResult<bool> {
        let dir = self.paths.thread_dir(thread_id);
        if !dir.exists() {
            return Ok(false);
        }
        let lock = self.thread_lock(thread_id).await;
        let _guard = lock.lock().await;
        std::fs::remove_dir_all(&dir)?;
        Ok(true)
    }
}

fn build_thread_view(
    thread_id: &str,
    messages: &[Message],
    read: &BTreeSet<String>,
) -> Option<ThreadView> {
    let last = messages.last()?;

    let mut participants: BTreeSet<String> = BTreeSet::new();
    let mut subject = None;
    let mut session_id = None;
    let mut unread = 0usize;
    for message in messages {
        participants.insert(message.from.clone());
        participants.extend(message.to.iter().cloned());
        if subject.is_none() {
            subject = message.subject.clone();
        }
        if session_id.is_none() {
            if let Ok(Some(MessageEvent::SessionInvite(invite))) = message.event() {
                session_id = Some(invite.session_id);
            }
        }
        if !read.contains(&message.id) {
            unread += 1;
        }
    }

    Some(ThreadView {
        thread_id: thread_id.to_string(),
        subject,
        participants: participants.into_iter().collect(),
        unread_count: unread,
        last_message_at: last.created_at,
        last_message_preview: preview_of(&last.body),
        session_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::DigestSigner;
    use tempfile::tempdir;

    fn store_for(dir: &Path, email: &str) -> MessageStore {
        let paths = VaultPaths::new(dir, dir, email);
        MessageStore::open(paths, Arc::new(DigestSigner::new(email))).unwrap()
    }

    fn send_req(to: &[&str], body: &str) -> SendMessageRequest {
        SendMessageRequest {
            to: to.iter().map(|s| s.to_string()).collect(),
            body: body.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_queues_for_each_recipient() {
        let dir = tempdir().unwrap();
        let alice = store_for(dir.path(), "a@x");

        let msg = alice.send(send_req(&["b@x", "c@x"], "hello")).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.thread_id, participant_signature(["a@x", "b@x", "c@x"]));

        for peer in ["b@x", "c@x"] {
            let queued = alice
                .paths()
                .rpc_message_dir(peer)
                .join(format!("{}.json", msg.id));
            assert!(queued.exists(), "missing queue file for {peer}");
        }
        // Sender's own copy is in its inbox and already read.
        let threads = alice.list_threads(&ThreadScope::All).unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].unread_count, 0);
    }

    #[tokio::test]
    async fn both_directions_share_a_thread() {
        let dir = tempdir().unwrap();
        let alice = store_for(dir.path(), "a@x");
        let bob = store_for(dir.path(), "b@x");

        // a → b lands in b's queue (same data dir, so no sync needed).
        let sent = alice
            .send(SendMessageRequest {
                to: vec!["b@x".into()],
                subject: Some("Hi".into()),
                body: "hello bob".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let report = bob.deliver_incoming().await.unwrap();
        assert_eq!(report.new_messages.len(), 1);

        // b → a later appears in the same thread on both sides.
        bob.send(send_req(&["a@x"], "hey alice")).await.unwrap();
        alice.deliver_incoming().await.unwrap();

        let a_threads = alice.list_threads(&ThreadScope::All).unwrap();
        let b_threads = bob.list_threads(&ThreadScope::All).unwrap();
        assert_eq!(a_threads.len(), 1);
        assert_eq!(b_threads.len(), 1);
        assert_eq!(a_threads[0].thread_id, sent.thread_id);
        assert_eq!(b_threads[0].thread_id, sent.thread_id);
        assert_eq!(b_threads[0].subject.as_deref(), Some("Hi"));

        let history = alice.thread_messages(&sent.thread_id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].created_at <= history[1].created_at);
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let dir = tempdir().unwrap();
        let alice = store_for(dir.path(), "a@x");
        let bob = store_for(dir.path(), "b@x");

        let msg = alice.send(send_req(&["b@x"], "once")).await.unwrap();
        let queue_file = alice
            .paths()
            .rpc_message_dir("b@x")
            .join(format!("{}.json", msg.id));
        let copy = std::fs::read(&queue_file).unwrap();

        assert_eq!(bob.deliver_incoming().await.unwrap().new_messages.len(), 1);

        // The sync layer re-materializes the same file; delivery is a no-op.
        std::fs::write(&queue_file, &copy).unwrap();
        let report = bob.deliver_incoming().await.unwrap();
        assert!(report.new_messages.is_empty());
        assert!(!queue_file.exists());
        assert_eq!(bob.thread_messages(&msg.thread_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resending_known_id_is_a_noop() {
        let dir = tempdir().unwrap();
        let alice = store_for(dir.path(), "a@x");

        let first = alice.send(send_req(&["b@x"], "original")).await.unwrap();
        let second = alice
            .send(SendMessageRequest {
                id: Some(first.id.clone()),
                to: vec!["b@x".into()],
                body: "overwrite attempt".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.body, "original");
        assert_eq!(
            alice.thread_messages(&first.thread_id).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn unread_and_mark_read() {
        let dir = tempdir().unwrap();
        let alice = store_for(dir.path(), "a@x");
        let bob = store_for(dir.path(), "b@x");

        alice.send(send_req(&["b@x"], "one")).await.unwrap();
        alice.send(send_req(&["b@x"], "two")).await.unwrap();
        bob.deliver_incoming().await.unwrap();

        let threads = bob.list_threads(&ThreadScope::Unread).unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].unread_count, 2);

        bob.mark_thread_read(&threads[0].thread_id).unwrap();
        assert!(bob.list_threads(&ThreadScope::Unread).unwrap().is_empty());

        // Read state survives a reopen.
        let bob2 = store_for(dir.path(), "b@x");
        let threads = bob2.list_threads(&ThreadScope::All).unwrap();
        assert_eq!(threads[0].unread_count, 0);
    }

    #[tokio::test]
    async fn delete_thread_is_local_only() {
        let dir = tempdir().unwrap();
        let alice = store_for(dir.path(), "a@x");
        let bob = store_for(dir.path(), "b@x");

        let msg = alice.send(send_req(&["b@x"], "kept by peer")).await.unwrap();
        bob.deliver_incoming().await.unwrap();

        assert!(alice.delete_thread(&msg.thread_id).await.unwrap());
        assert!(matches!(
            alice.thread_messages(&msg.thread_id),
            Err(CoreError::NotFound(_))
        ));
        // Bob's inbox is untouched.
        assert_eq!(bob.thread_messages(&msg.thread_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_message_removes_single_record() {
        let dir = tempdir().unwrap();
        let alice = store_for(dir.path(), "a@x");
        let m1 = alice.send(send_req(&["b@x"], "first")).await.unwrap();
        alice.send(send_req(&["b@x"], "second")).await.unwrap();

        assert!(alice.delete_message(&m1.id).await.unwrap());
        assert!(!alice.delete_message(&m1.id).await.unwrap());
        assert_eq!(alice.thread_messages(&m1.thread_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn multiple_event_keys_rejected() {
        let dir = tempdir().unwrap();
        let alice = store_for(dir.path(), "a@x");

        let mut metadata = serde_json::Map::new();
        metadata.insert("flow_request".into(), serde_json::json!({}));
        metadata.insert("flow_results".into(), serde_json::json!({}));
        let err = alice
            .send(SendMessageRequest {
                to: vec!["b@x".into()],
                body: "bad".into(),
                metadata,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at most one"));
    }

    #[tokio::test]
    async fn session_invite_event_round_trips() {
        let dir = tempdir().unwrap();
        let alice = store_for(dir.path(), "a@x");
        let bob = store_for(dir.path(), "b@x");

        let invite = SessionInvite {
            session_id: "sess-1".into(),
            session_name: "S".into(),
            requester: "a@x".into(),
            description: None,
            created_at: Utc::now(),
        };
        let mut metadata = serde_json::Map::new();
        metadata.insert("session_invite".into(), serde_json::to_value(&invite).unwrap());
        alice
            .send(SendMessageRequest {
                to: vec!["b@x".into()],
                body: "join me".into(),
                metadata,
                ..Default::default()
            })
            .await
            .unwrap();

        let delivered = bob.deliver_incoming().await.unwrap().new_messages;
        let event = delivered[0].event().unwrap().unwrap();
        assert_eq!(event, MessageEvent::SessionInvite(invite));

        // Thread view surfaces the linked session.
        let threads = bob.list_threads(&ThreadScope::All).unwrap();
        assert_eq!(threads[0].session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn corrupt_queue_file_counts_as_failed() {
        let dir = tempdir().unwrap();
        let bob = store_for(dir.path(), "b@x");
        let queue = bob.paths().rpc_message_dir("b@x");
        std::fs::write(queue.join("junk.json"), "{nope").unwrap();

        let report = bob.deliver_incoming().await.unwrap();
        assert_eq!(report.new_failed, 1);
        assert!(report.new_messages.is_empty());
        // Moved aside so the next scan doesn't retry it forever.
        assert!(queue.join("junk.json.failed").exists());
    }
}
