use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CoreResult;

use super::messages::{MessageStore, SendMessageRequest};
use super::threads::{participant_signature, ThreadScope, ThreadView};

/// A Space is the equivalence class of threads sharing one participant
/// signature. Nothing is persisted for it; the view is derived on demand
/// and `space_id` is the signature itself (one-to-one with the thread id).
#[derive(Debug, Clone, Serialize)]
pub struct Space {
    pub space_id: String,
    pub name: String,
    pub participants: Vec<String>,
    pub member_count: usize,
    pub last_activity_at: DateTime<Utc>,
    pub last_message_preview: String,
    pub unread_count: usize,
}

/// Collapse threads into Spaces. Threads whose participant sets agree are
/// merged even if their directories were created under different ids by a
/// misbehaving sender.
pub fn aggregate(threads: &[ThreadView], self_email: &str) -> Vec<Space> {
    let mut by_signature: BTreeMap<String, Vec<&ThreadView>> = BTreeMap::new();
    for thread in threads {
        let signature = participant_signature(&thread.participants);
        by_signature.entry(signature).or_default().push(thread);
    }

    let mut spaces: Vec<Space> = by_signature
        .into_iter()
        .map(|(signature, group)| {
            let newest = group
                .iter()
                .max_by_key(|t| t.last_message_at)
                .copied()
                .expect("group is non-empty");
            let participants = newest.participants.clone();
            Space {
                space_id: signature,
                name: space_name(newest, &participants, self_email),
                member_count: participants.len(),
                participants,
                last_activity_at: newest.last_message_at,
                last_message_preview: newest.last_message_preview.clone(),
                unread_count: group.iter().map(|t| t.unread_count).sum(),
            }
        })
        .collect();
    spaces.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
    spaces
}

/// Display name: the thread subject when set, otherwise the other
/// participants.
fn space_name(thread: &ThreadView, participants: &[String], self_email: &str) -> String {
    if let Some(subject) = &thread.subject {
        if !subject.is_empty() {
            return subject.clone();
        }
    }
    let others: Vec<&str> = participants
        .iter()
        .filter(|p| p.as_str() != self_email)
        .map(|p| p.as_str())
        .collect();
    if others.is_empty() {
        self_email.to_string()
    } else {
        others.join(", ")
    }
}

/// List the owner's Spaces.
pub fn list_spaces(store: &MessageStore) -> CoreResult<Vec<Space>> {
    let threads = store.list_threads(&ThreadScope::All)?;
    Ok(aggregate(&threads, store.paths().owner()))
}

/// Create (or reopen) a Space for a participant set. When a Space with the
/// same signature already exists it is returned untouched; otherwise a
/// seed message establishes the thread.
pub async fn create_space(
    store: &MessageStore,
    participants: &[String],
    name: Option<String>,
) -> CoreResult<Space> {
    let mut full: Vec<String> = participants.to_vec();
    full.push(store.paths().owner().to_string());
    let signature = participant_signature(&full);

    if let Some(existing) = list_spaces(store)?.into_iter().find(|s| s.space_id == signature) {
        return Ok(existing);
    }

    store
        .send(SendMessageRequest {
            to: participants.to_vec(),
            subject: name.clone(),
            body: name.unwrap_or_else(|| "New space".to_string()),
            ..Default::default()
        })
        .await?;

    list_spaces(store)?
        .into_iter()
        .find(|s| s.space_id == signature)
        .ok_or_else(|| crate::error::CoreError::Internal("seed message did not create a space".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::messages::MessageStore;
    use crate::vault::{DigestSigner, VaultPaths};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store_for(dir: &std::path::Path, email: &str) -> MessageStore {
        let paths = VaultPaths::new(dir, dir, email);
        MessageStore::open(paths, Arc::new(DigestSigner::new(email))).unwrap()
    }

    fn thread(participants: &[&str], unread: usize, at: DateTime<Utc>) -> ThreadView {
        ThreadView {
            thread_id: participant_signature(participants),
            subject: None,
            participants: participants.iter().map(|s| s.to_string()).collect(),
            unread_count: unread,
            last_message_at: at,
            last_message_preview: "…".into(),
            session_id: None,
        }
    }

    #[test]
    fn same_participants_collapse_to_one_space() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::minutes(5);
        let threads = vec![
            thread(&["a@x", "b@x"], 2, earlier),
            thread(&["b@x", "a@x"], 3, now),
            thread(&["a@x", "c@x"], 1, now),
        ];

        let spaces = aggregate(&threads, "a@x");
        assert_eq!(spaces.len(), 2);

        let merged = spaces
            .iter()
            .find(|s| s.space_id == participant_signature(["a@x", "b@x"]))
            .unwrap();
        assert_eq!(merged.unread_count, 5);
        assert_eq!(merged.last_activity_at, now);
        assert_eq!(merged.member_count, 2);
        assert_eq!(merged.name, "b@x");
    }

    #[tokio::test]
    async fn create_space_is_idempotent_per_signature() {
        let dir = tempdir().unwrap();
        let alice = store_for(dir.path(), "a@x");

        let first = create_space(&alice, &["b@x".into()], Some("Research".into()))
            .await
            .unwrap();
        assert_eq!(first.name, "Research");

        let second = create_space(&alice, &["B@X".into()], Some("Research again".into()))
            .await
            .unwrap();
        assert_eq!(second.space_id, first.space_id);

        // No duplicate thread was seeded.
        let threads = alice.list_threads(&ThreadScope::All).unwrap();
        assert_eq!(threads.len(), 1);
    }

    #[test]
    fn space_id_equals_thread_signature() {
        let threads = vec![thread(&["a@x", "b@x"], 0, Utc::now())];
        let spaces = aggregate(&threads, "a@x");
        assert_eq!(spaces[0].space_id, threads[0].thread_id);
    }
}
