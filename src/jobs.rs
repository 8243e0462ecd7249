use crate::{
    altered::{TokenError, TokenProvider, TransferClient},
    events::EventSink,
    models::{JobEvent, Operation, OperationOutcome, RunRecord, Severity},
    store::{JobProgress, Store},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration, time::Instant};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const STOPPED_BY_USER: &str = "stopped by user";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("a transfer job is already in progress")]
    AlreadyInProgress,
    #[error("no credential: {0}")]
    NoCredential(#[from] TokenError),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("job task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Throttle between consecutive give calls.
    pub pause: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pause: Duration::from_secs(2),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        std::env::var("TRANSFER_PAUSE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|ms| Self {
                pause: Duration::from_millis(ms),
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Idle,
    Running,
    Cancelling,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: JobPhase,
    pub progress: usize,
    pub total: usize,
    pub started_at: Option<DateTime<Utc>>,
}

struct ActiveJob {
    cancel: CancellationToken,
    progress: usize,
    total: usize,
    started_at: DateTime<Utc>,
}

/// Handle on a started job.
pub struct JobTicket {
    pub total: usize,
    pub started_at: DateTime<Utc>,
    handle: JoinHandle<Result<RunRecord, OrchestratorError>>,
}

impl JobTicket {
    pub async fn wait(self) -> Result<RunRecord, OrchestratorError> {
        self.handle
            .await
            .map_err(|err| OrchestratorError::Aborted(err.to_string()))?
    }
}

/// Runs at most one batch transfer at a time.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    transfers: Arc<dyn TransferClient>,
    tokens: Arc<dyn TokenProvider>,
    store: Arc<Store>,
    sink: Arc<dyn EventSink>,
    config: OrchestratorConfig,
    slot: Mutex<Option<ActiveJob>>,
}

impl Orchestrator {
    pub fn new(
        transfers: Arc<dyn TransferClient>,
        tokens: Arc<dyn TokenProvider>,
        store: Arc<Store>,
        sink: Arc<dyn EventSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transfers,
                tokens,
                store,
                sink,
                config,
                slot: Mutex::new(None),
            }),
        }
    }

    /// Starts a job unless one is running; a running job is never queued behind.
    pub async fn start(
        &self,
        recipient_id: String,
        operations: Vec<Operation>,
    ) -> Result<JobTicket, OrchestratorError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.is_some() {
            info!(target = "altered.jobs", "start rejected, job already running");
            return Err(OrchestratorError::AlreadyInProgress);
        }
        validate(&recipient_id, &operations)?;

        let cancel = CancellationToken::new();
        let total = operations.len();
        let started_at = Utc::now();
        *slot = Some(ActiveJob {
            cancel: cancel.clone(),
            progress: 0,
            total,
            started_at,
        });
        drop(slot);

        info!(target = "altered.jobs", recipient = %recipient_id, total, "transfer job started");
        self.inner
            .persist(JobProgress {
                running: true,
                progress: 0,
                total,
            })
            .await;

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            inner
                .execute(recipient_id, operations, cancel, started_at)
                .await
        });
        Ok(JobTicket {
            total,
            started_at,
            handle,
        })
    }

    /// Flags the running job; the loop notices at its next iteration boundary.
    pub async fn request_cancel(&self) -> bool {
        let slot = self.inner.slot.lock().await;
        match slot.as_ref() {
            Some(job) => {
                info!(target = "altered.jobs", progress = job.progress, total = job.total, "cancel requested");
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn status(&self) -> JobStatus {
        let slot = self.inner.slot.lock().await;
        match slot.as_ref() {
            Some(job) => JobStatus {
                state: if job.cancel.is_cancelled() {
                    JobPhase::Cancelling
                } else {
                    JobPhase::Running
                },
                progress: job.progress,
                total: job.total,
                started_at: Some(job.started_at),
            },
            None => JobStatus {
                state: JobPhase::Idle,
                progress: 0,
                total: 0,
                started_at: None,
            },
        }
    }
}

fn validate(recipient_id: &str, operations: &[Operation]) -> Result<(), OrchestratorError> {
    if recipient_id.trim().is_empty() {
        return Err(OrchestratorError::InvalidJob("recipient is required".into()));
    }
    if operations.is_empty() {
        return Err(OrchestratorError::InvalidJob("no operations".into()));
    }
    if let Some(op) = operations
        .iter()
        .find(|op| op.quantity == 0 || op.identifier.trim().is_empty())
    {
        return Err(OrchestratorError::InvalidJob(format!(
            "invalid operation `{} {}`",
            op.quantity, op.identifier
        )));
    }
    Ok(())
}

impl Inner {
    async fn execute(
        &self,
        recipient_id: String,
        operations: Vec<Operation>,
        cancel: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> Result<RunRecord, OrchestratorError> {
        self.sink.emit(JobEvent::status(
            "Getting authentication token...",
            Severity::Info,
        ));
        let token = match self.tokens.bearer_token().await {
            Ok(token) => token,
            Err(err) => {
                warn!(target = "altered.jobs", error = %err, "credential unavailable, job aborted");
                self.sink.emit(JobEvent::JobComplete {
                    success: false,
                    summary: err.to_string(),
                    run_record: None,
                });
                self.finish().await;
                return Err(OrchestratorError::NoCredential(err));
            }
        };

        let total = operations.len();
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        let mut attempted = 0;

        for (index, operation) in operations.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(target = "altered.jobs", stopped_at = index, total, "job stopped by user");
                failures.extend(operations[index..].iter().cloned().map(|operation| {
                    OperationOutcome::Failure {
                        operation,
                        reason: STOPPED_BY_USER.to_string(),
                    }
                }));
                break;
            }

            self.sink.emit(JobEvent::status(
                format!("Sending {}x {}...", operation.quantity, operation.identifier),
                Severity::Info,
            ));
            let call_started = Instant::now();
            attempted += 1;
            match self
                .transfers
                .give(&recipient_id, operation, &token)
                .await
            {
                Ok(()) => {
                    crate::metrics::transfer_outcome(true, call_started.elapsed().as_millis());
                    successes.push(OperationOutcome::Success {
                        operation: operation.clone(),
                    });
                }
                Err(err) => {
                    crate::metrics::transfer_outcome(false, call_started.elapsed().as_millis());
                    warn!(target = "altered.jobs", reference = %operation.identifier, error = %err, "give failed");
                    self.sink
                        .emit(JobEvent::status(format!("Error: {err}"), Severity::Error));
                    failures.push(OperationOutcome::Failure {
                        operation: operation.clone(),
                        reason: err.to_string(),
                    });
                }
            }

            let current = index + 1;
            self.sink.emit(JobEvent::Progress { current, total });
            self.advance(current, total).await;

            if current < total && !cancel.is_cancelled() {
                tokio::select! {
                    _ = sleep(self.config.pause) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        let record = RunRecord {
            id: Uuid::new_v4(),
            recipient_id,
            total,
            operations_attempted: attempted,
            successes,
            failures,
            started_at,
            ended_at: Utc::now(),
        };
        if let Err(err) = self.store.record_run(record.clone()).await {
            warn!(target = "altered.jobs", error = %err, "failed to persist run record");
        }

        info!(
            target = "altered.jobs",
            successes = record.successes.len(),
            failures = record.failures.len(),
            "transfer job completed"
        );
        self.sink.emit(JobEvent::JobComplete {
            success: record.failures.is_empty(),
            summary: record.summary(),
            run_record: Some(record.clone()),
        });
        self.finish().await;
        Ok(record)
    }

    async fn advance(&self, progress: usize, total: usize) {
        if let Some(job) = self.slot.lock().await.as_mut() {
            job.progress = progress;
        }
        self.persist(JobProgress {
            running: true,
            progress,
            total,
        })
        .await;
    }

    async fn persist(&self, progress: JobProgress) {
        if let Err(err) = self.store.set_job_progress(progress).await {
            warn!(target = "altered.jobs", error = %err, "failed to persist job progress");
        }
    }

    /// Persists the end of the job before freeing the slot, so a job started
    /// right after never has its running flag overwritten.
    async fn finish(&self) {
        let mut slot = self.slot.lock().await;
        if let Err(err) = self.store.finish_job().await {
            warn!(target = "altered.jobs", error = %err, "failed to persist job end");
        }
        *slot = None;
    }
}
