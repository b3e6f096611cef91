use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload of a background reservation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub event_id: String,
    pub user_id: String,
    pub ticket_type_id: String,
    pub quantity: u32,
}

/// Which dispatch path carried (or is carrying) a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPath {
    Primary,
    Backup,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Primary,
    Backup,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Primary => "primary",
            QueueKind::Backup => "backup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { via: ProcessingPath },
    /// Another path already completed this reservation; skipped without
    /// re-running it.
    Deduped,
    Failed { error: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Deduped | JobState::Failed { .. }
        )
    }
}

/// A job as tracked by one queue's registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub queue: QueueKind,
    pub state: JobState,
    pub request: ReservationRequest,
    /// Shared across both paths; equals the primary job id when the primary
    /// submission succeeded.
    pub dedupe_key: String,
    /// Primary records remember their redundant backup submission.
    pub backup_job_id: Option<String>,
    pub outcome: Option<serde_json::Value>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of submitting a reservation through the dual-path dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReceipt {
    /// Absent only when the primary queue refused the job and the backup
    /// accepted it.
    pub primary_job_id: Option<String>,
    pub backup_job_id: Option<String>,
    pub processing_path: ProcessingPath,
}

/// Status view returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub queue: QueueKind,
    pub state: JobState,
    pub outcome: Option<serde_json::Value>,
}

impl JobStatus {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            queue: record.queue,
            state: record.state.clone(),
            outcome: record.outcome.clone(),
        }
    }
}
