use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    Syncing,
    Uploading,
    Downloading,
    Completed,
    Error,
}

/// One tracked transfer in the sync queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub path: String,
    pub state: QueueState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSummary {
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub error: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub summary: QueueSummary,
    pub files: Vec<QueueEntry>,
}

impl QueueStatus {
    pub fn from_entries(mut files: Vec<QueueEntry>) -> Self {
        files.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.path.cmp(&b.path)));
        let mut summary = QueueSummary::default();
        for entry in &files {
            match entry.state {
                QueueState::Pending => summary.pending += 1,
                // In-flight transfers in either direction count as syncing.
                QueueState::Syncing | QueueState::Uploading | QueueState::Downloading => {
                    summary.syncing += 1
                }
                QueueState::Completed => summary.completed += 1,
                QueueState::Error => summary.error += 1,
            }
        }
        QueueStatus { summary, files }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, state: QueueState) -> QueueEntry {
        QueueEntry {
            path: path.into(),
            state,
            progress: None,
            size: Some(10),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn summary_buckets_states() {
        let status = QueueStatus::from_entries(vec![
            entry("a", QueueState::Pending),
            entry("b", QueueState::Uploading),
            entry("c", QueueState::Downloading),
            entry("d", QueueState::Completed),
            entry("e", QueueState::Completed),
            entry("f", QueueState::Error),
        ]);
        assert_eq!(
            status.summary,
            QueueSummary { pending: 1, syncing: 2, completed: 2, error: 1 }
        );
    }

    #[test]
    fn empty_queue_has_zero_summary() {
        let status = QueueStatus::from_entries(Vec::new());
        assert_eq!(status.summary, QueueSummary::default());
        assert!(status.files.is_empty());
    }
}
