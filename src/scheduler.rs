//! Scheduler: admission, batch creation, and lifecycle orchestration
//! (spec §4.2). The single component that talks to the Validator, the Job
//! Registry, and the Worker Pool in sequence; HTTP/WS handlers never touch
//! those three directly.

use crate::bus::{BusEvent, ProgressBus};
use crate::domain::JobState;
use crate::error::{AppError, AppResult};
use crate::options::ProcessingOptions;
use crate::registry::{AdmittedFile, JobRegistry, JobSnapshot};
use crate::validator::Validator;
use crate::worker::WorkerPool;
use std::sync::Arc;
use uuid::Uuid;

/// One submitted file before admission (spec §4.2 "Inputs").
pub struct RawFile {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub declared_mime: Option<String>,
}

/// Per-file admission outcome, returned alongside the job id so the HTTP
/// layer can report partial rejections (spec §6.1 `POST /api/batch-convert`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AdmissionReport {
    pub filename: String,
    pub accepted: bool,
    pub reason: Option<String>,
}

pub struct BatchOutcome {
    pub job_id: Option<Uuid>,
    pub admitted: Vec<AdmissionReport>,
}

pub struct Scheduler {
    registry: Arc<JobRegistry>,
    validator: Arc<Validator>,
    worker_pool: Arc<WorkerPool>,
    bus: Arc<ProgressBus>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        validator: Arc<Validator>,
        worker_pool: Arc<WorkerPool>,
        bus: Arc<ProgressBus>,
    ) -> Self {
        Scheduler {
            registry,
            validator,
            worker_pool,
            bus,
        }
    }

    /// Validate every file, create a Job from whatever is admitted, and
    /// submit its tasks to the Worker Pool (spec §4.2 `start_batch`).
    ///
    /// Per spec §4.2 "Partial rejection": a batch with at least one
    /// admitted file still runs; a batch with zero admitted files returns no
    /// job id at all, the per-file reasons are reported back to the caller.
    pub fn start_batch(
        &self,
        options: ProcessingOptions,
        files: Vec<RawFile>,
    ) -> AppResult<BatchOutcome> {
        if let Err(msg) = options.validate() {
            return Err(AppError::input_invalid(msg));
        }

        let mut admitted = Vec::with_capacity(files.len());
        let mut accepted_files = Vec::with_capacity(files.len());
        for file in files {
            let result = self
                .validator
                .validate(&file.bytes, file.declared_mime.as_deref());
            if result.safe {
                admitted.push(AdmissionReport {
                    filename: file.filename.clone(),
                    accepted: true,
                    reason: None,
                });
                accepted_files.push(AdmittedFile {
                    filename: file.filename,
                    bytes: Arc::new(file.bytes),
                });
            } else {
                admitted.push(AdmissionReport {
                    filename: file.filename,
                    accepted: false,
                    reason: result.rejection_reason,
                });
            }
        }

        if accepted_files.is_empty() {
            return Ok(BatchOutcome {
                job_id: None,
                admitted,
            });
        }

        let job_id = self.registry.create_job(options, accepted_files);
        self.registry.start(job_id)?;

        let snapshot = self.registry.snapshot(job_id)?;
        self.bus.publish(
            job_id,
            BusEvent::BatchStarted(crate::http::snapshot_json(&snapshot.job)),
        );

        let task_ids: Vec<Uuid> = snapshot.job.tasks.iter().map(|t| t.task_id).collect();
        for task_id in task_ids {
            if let Err(err) = self.worker_pool.submit(job_id, task_id) {
                // spec §4.2 "Queue-full handling": a submission failure after
                // the job was created fails the whole job rather than
                // leaving it stuck with orphaned PENDING tasks.
                self.registry.fail(job_id, err.to_string())?;
                self.bus.publish(
                    job_id,
                    BusEvent::BatchError(serde_json::json!({
                        "error_code": err.kind().as_code_str(),
                        "message": err.message,
                    })),
                );
                break;
            }
        }

        Ok(BatchOutcome {
            job_id: Some(job_id),
            admitted,
        })
    }

    pub fn progress(&self, job_id: Uuid) -> AppResult<JobSnapshot> {
        self.registry.snapshot(job_id)
    }

    /// Cancel a job in flight. Idempotent; cancelling an already-terminal
    /// job is a no-op returning its current state (spec §4.2 `cancel`).
    pub fn cancel(&self, job_id: Uuid) -> AppResult<JobState> {
        let prior = self.registry.cancel(job_id)?;
        if prior != JobState::Created && prior.is_terminal() {
            return Ok(prior);
        }
        // registry.cancel may have drained every PENDING task synchronously
        // (a still-queued job, or a RUNNING job with no worker yet touching
        // it) and already reached CANCELLED; publish the terminal event
        // here since no worker will otherwise ever do it for us.
        if let Ok(snapshot) = self.registry.snapshot(job_id) {
            if snapshot.job.state == JobState::Cancelled {
                self.bus.publish(
                    job_id,
                    BusEvent::BatchCancelled(crate::http::snapshot_json(&snapshot.job)),
                );
            }
        }
        Ok(prior)
    }

    pub fn list_active(&self) -> Vec<Uuid> {
        self.registry.list_active()
    }

    pub fn list_all(&self) -> Vec<JobSnapshot> {
        self.registry.list_all()
    }

    /// Periodic janitor sweep (spec §4.2 `cleanup`, §6.3 `job_retention`).
    pub fn cleanup(&self, max_age: chrono::Duration) -> usize {
        self.registry.reap(max_age)
    }
}
