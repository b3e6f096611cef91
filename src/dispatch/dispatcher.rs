use crate::config::QueueConfig;
use crate::dispatch::{CompletionTracker, JobQueue};
use crate::domain::{
    DispatchReceipt, JobState, JobStatus, ProcessingPath, QueueKind, ReservationRequest,
};
use crate::{LobbyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Submits reservation jobs down two redundant paths and reconciles status
/// from whichever finishes first.
pub struct ReservationDispatcher {
    primary: JobQueue,
    backup: JobQueue,
    backup_delay: Duration,
    tracker: Arc<CompletionTracker>,
}

impl ReservationDispatcher {
    pub fn new(
        primary: JobQueue,
        backup: JobQueue,
        config: &QueueConfig,
        tracker: Arc<CompletionTracker>,
    ) -> Self {
        Self {
            primary,
            backup,
            backup_delay: config.backup_delay(),
            tracker,
        }
    }

    /// Submit a reservation. The backup submission shares the primary job's
    /// id as its dedupe key; losing the backup degrades the path, not the
    /// call. Only when neither queue accepts the job does the call fail, and
    /// then with the primary path's error.
    pub fn reserve(&self, request: ReservationRequest) -> Result<DispatchReceipt> {
        match self.primary.enqueue(request.clone(), None) {
            Ok(primary_job_id) => {
                match self.backup.enqueue_delayed(
                    request,
                    Some(primary_job_id.clone()),
                    self.backup_delay,
                ) {
                    Ok(backup_job_id) => {
                        self.primary.link_backup(&primary_job_id, &backup_job_id);
                        Ok(DispatchReceipt {
                            primary_job_id: Some(primary_job_id),
                            backup_job_id: Some(backup_job_id),
                            processing_path: ProcessingPath::Both,
                        })
                    }
                    Err(e) => {
                        warn!(
                            "backup submission failed, continuing on the primary path alone: {}",
                            e
                        );
                        Ok(DispatchReceipt {
                            primary_job_id: Some(primary_job_id),
                            backup_job_id: None,
                            processing_path: ProcessingPath::Primary,
                        })
                    }
                }
            }
            Err(primary_error) => {
                warn!("primary submission failed: {}", primary_error);
                match self
                    .backup
                    .enqueue_delayed(request, None, Duration::ZERO)
                {
                    Ok(backup_job_id) => Ok(DispatchReceipt {
                        primary_job_id: None,
                        backup_job_id: Some(backup_job_id),
                        processing_path: ProcessingPath::Backup,
                    }),
                    Err(_) => Err(LobbyError::JobFailed(primary_error.to_string())),
                }
            }
        }
    }

    /// Secondary-path submission for callers that already hold a dedupe key.
    pub fn backup_reserve(&self, request: ReservationRequest, dedupe_key: String) -> Result<String> {
        self.backup
            .enqueue_delayed(request, Some(dedupe_key), self.backup_delay)
    }

    /// Poll a job. The primary answer wins when terminal; a pending primary
    /// with a completed backup is folded into the primary record, running
    /// the (deduplicated) completion side effects at most once.
    pub async fn job_status(&self, job_id: &str, queue: QueueKind) -> Result<JobStatus> {
        match queue {
            QueueKind::Backup => self
                .backup
                .record(job_id)
                .map(|record| JobStatus::from_record(&record))
                .ok_or_else(|| LobbyError::not_found(format!("backup job {}", job_id))),

            QueueKind::Primary => {
                let record = self
                    .primary
                    .record(job_id)
                    .ok_or_else(|| LobbyError::not_found(format!("job {}", job_id)))?;

                if record.state.is_terminal() {
                    return Ok(JobStatus::from_record(&record));
                }

                if let Some(backup_job_id) = &record.backup_job_id {
                    if let Some(backup) = self.backup.record(backup_job_id) {
                        if matches!(backup.state, JobState::Completed { .. }) {
                            self.primary.complete_via(
                                job_id,
                                ProcessingPath::Backup,
                                backup.outcome.clone(),
                            );
                            self.tracker
                                .complete(&record.dedupe_key, &record.request)
                                .await;
                            if let Some(updated) = self.primary.record(job_id) {
                                return Ok(JobStatus::from_record(&updated));
                            }
                        }
                    }
                }

                Ok(JobStatus::from_record(&record))
            }
        }
    }

    pub fn close(&self) {
        self.primary.close();
        self.backup.close();
    }
}
