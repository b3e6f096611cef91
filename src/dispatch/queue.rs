use crate::config::QueueConfig;
use crate::dispatch::{CompletionTracker, ReservationProcessor};
use crate::domain::{JobRecord, JobState, ProcessingPath, QueueKind, ReservationRequest};
use crate::metrics::Metrics;
use crate::{LobbyError, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// In-process background job queue with a bounded backlog and a worker
/// pool. One instance per dispatch path; both share a completion tracker so
/// a reservation settles exactly once.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    kind: QueueKind,
    registry: DashMap<String, JobRecord>,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    pending: AtomicUsize,
    max_pending: usize,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    processor: Arc<dyn ReservationProcessor>,
    tracker: Arc<CompletionTracker>,
    metrics: Arc<Metrics>,
}

impl JobQueue {
    pub fn start(
        kind: QueueKind,
        config: &QueueConfig,
        processor: Arc<dyn ReservationProcessor>,
        tracker: Arc<CompletionTracker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(QueueInner {
            kind,
            registry: DashMap::new(),
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
            max_pending: config.max_pending,
            closed: AtomicBool::new(false),
            shutdown,
            processor,
            tracker,
            metrics,
        });

        for worker in 0..config.workers.max(1) {
            let inner = Arc::clone(&inner);
            let shutdown_rx = inner.shutdown.subscribe();
            tokio::spawn(async move {
                debug!("{} queue worker {} started", inner.kind.as_str(), worker);
                run_worker(inner, shutdown_rx).await;
            });
        }

        Self { inner }
    }

    /// Submit a job for immediate execution. `dedupe_key` defaults to the
    /// job's own id.
    pub fn enqueue(
        &self,
        request: ReservationRequest,
        dedupe_key: Option<String>,
    ) -> Result<String> {
        let job_id = self.inner.admit(request, dedupe_key)?;
        if self.inner.tx.send(job_id.clone()).is_err() {
            self.inner.fail(&job_id, "queue workers are gone");
            return Err(LobbyError::BackendUnavailable(format!(
                "{} queue is not accepting jobs",
                self.inner.kind.as_str()
            )));
        }
        Ok(job_id)
    }

    /// Submit a job that becomes runnable after `delay`.
    pub fn enqueue_delayed(
        &self,
        request: ReservationRequest,
        dedupe_key: Option<String>,
        delay: Duration,
    ) -> Result<String> {
        let job_id = self.inner.admit(request, dedupe_key)?;

        let inner = Arc::clone(&self.inner);
        let released_id = job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.tx.send(released_id.clone()).is_err() {
                inner.fail(&released_id, "queue closed before the delayed job ran");
            }
        });

        Ok(job_id)
    }

    pub fn record(&self, job_id: &str) -> Option<JobRecord> {
        self.inner.registry.get(job_id).map(|r| r.clone())
    }

    /// Remember the redundant backup submission on a primary record.
    pub fn link_backup(&self, job_id: &str, backup_job_id: &str) {
        if let Some(mut record) = self.inner.registry.get_mut(job_id) {
            record.backup_job_id = Some(backup_job_id.to_string());
            record.updated_at = Utc::now();
        }
    }

    /// Fold a completion observed on the other path into this record.
    pub fn complete_via(&self, job_id: &str, via: ProcessingPath, outcome: Option<serde_json::Value>) {
        if let Some(mut record) = self.inner.registry.get_mut(job_id) {
            if !record.state.is_terminal() {
                record.state = JobState::Completed { via };
                record.outcome = outcome;
                record.updated_at = Utc::now();
            }
        }
    }

    /// Refuse new submissions and stop the workers.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(true);
        info!("{} queue closed", self.inner.kind.as_str());
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }
}

impl QueueInner {
    fn admit(&self, request: ReservationRequest, dedupe_key: Option<String>) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LobbyError::BackendUnavailable(format!(
                "{} queue is closed",
                self.kind.as_str()
            )));
        }
        if self.pending.load(Ordering::SeqCst) >= self.max_pending {
            return Err(LobbyError::BackendUnavailable(format!(
                "{} queue backlog is full",
                self.kind.as_str()
            )));
        }

        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = JobRecord {
            job_id: job_id.clone(),
            queue: self.kind,
            state: JobState::Queued,
            dedupe_key: dedupe_key.unwrap_or_else(|| job_id.clone()),
            backup_job_id: None,
            outcome: None,
            request,
            submitted_at: now,
            updated_at: now,
        };
        self.registry.insert(job_id.clone(), record);
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.metrics.jobs_submitted.inc();
        self.metrics.queue_pending.inc();
        Ok(job_id)
    }

    fn update(&self, job_id: &str, state: JobState, outcome: Option<serde_json::Value>) {
        if let Some(mut record) = self.registry.get_mut(job_id) {
            record.state = state;
            if outcome.is_some() {
                record.outcome = outcome;
            }
            record.updated_at = Utc::now();
        }
    }

    fn fail(&self, job_id: &str, error: &str) {
        self.update(
            job_id,
            JobState::Failed {
                error: error.to_string(),
            },
            None,
        );
        self.metrics.jobs_failed.inc();
        self.settle();
    }

    fn settle(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.metrics.queue_pending.dec();
    }

    async fn run_job(&self, job_id: &str) {
        let (request, dedupe_key) = match self.registry.get(job_id) {
            Some(record) => (record.request.clone(), record.dedupe_key.clone()),
            None => return,
        };

        if self.tracker.is_complete(&dedupe_key) {
            self.update(job_id, JobState::Deduped, None);
            self.metrics.jobs_deduped.inc();
            self.settle();
            debug!(
                "{} job {} skipped, reservation already settled",
                self.kind.as_str(),
                job_id
            );
            return;
        }

        self.update(job_id, JobState::Running, None);

        match self.processor.process(&request).await {
            Ok(outcome) => {
                let via = match self.kind {
                    QueueKind::Primary => ProcessingPath::Primary,
                    QueueKind::Backup => ProcessingPath::Backup,
                };
                self.update(job_id, JobState::Completed { via }, Some(outcome));
                self.metrics.jobs_completed.inc();
                self.settle();
                self.tracker.complete(&dedupe_key, &request).await;
            }
            Err(e) => {
                warn!("{} job {} failed: {}", self.kind.as_str(), job_id, e);
                self.update(
                    job_id,
                    JobState::Failed {
                        error: e.to_string(),
                    },
                    None,
                );
                self.metrics.jobs_failed.inc();
                self.settle();
            }
        }
    }
}

async fn run_worker(inner: Arc<QueueInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let job_id = {
            let mut rx = inner.rx.lock().await;
            tokio::select! {
                job_id = rx.recv() => job_id,
                _ = shutdown.changed() => None,
            }
        };

        let Some(job_id) = job_id else { break };
        inner.run_job(&job_id).await;
    }
    debug!("{} queue worker stopped", inner.kind.as_str());
}
