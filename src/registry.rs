//! Job Registry: the authoritative in-memory store of all jobs and their
//! per-file outcomes (spec §4.4).

use crate::domain::{Job, JobCounters, JobState, TaskOutcome, TaskState};
use crate::error::{AppError, AppResult};
use crate::options::ProcessingOptions;
use crate::sync_ext::MutexExt;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A per-task input as supplied to `create_job` by the Scheduler: bytes
/// that already passed the Validator.
pub struct AdmittedFile {
    pub filename: String,
    pub bytes: Arc<Vec<u8>>,
}

/// Read-only projection returned by `snapshot` (spec §4.4).
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job: Job,
}

/// Registry-wide state is a map of per-job locks: each `Job` lives behind
/// its own `Mutex`, so registry-wide operations (`list_active`, `reap`) only
/// need a short-held registry lock, never one held across a codec call
/// (spec §4.4 "Concurrency").
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, Arc<Mutex<Job>>>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        JobRegistry {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_job(&self, options: ProcessingOptions, files: Vec<AdmittedFile>) -> Uuid {
        let job_id = Uuid::new_v4();
        let tasks = files
            .into_iter()
            .map(|f| {
                let fingerprint = crate::options::Fingerprint::compute(&f.bytes, &options);
                crate::domain::FileTask {
                    task_id: Uuid::new_v4(),
                    filename: f.filename,
                    source_bytes: f.bytes,
                    fingerprint,
                    state: TaskState::Pending,
                    started_at: None,
                    finished_at: None,
                    outcome: TaskOutcome::none(),
                }
            })
            .collect::<Vec<_>>();

        let total = tasks.len();
        let job = Job {
            job_id,
            options,
            tasks,
            state: JobState::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            counters: JobCounters {
                total,
                ..Default::default()
            },
            current_file_hint: None,
            admission_warnings: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        self.jobs
            .lock_unpoisoned()
            .insert(job_id, Arc::new(Mutex::new(job)));
        job_id
    }

    fn job_handle(&self, job_id: Uuid) -> AppResult<Arc<Mutex<Job>>> {
        self.jobs
            .lock_unpoisoned()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| AppError::job_not_found(format!("no such job {job_id}")))
    }

    pub fn start(&self, job_id: Uuid) -> AppResult<()> {
        let handle = self.job_handle(job_id)?;
        let mut job = handle.lock_unpoisoned();
        if job.state == JobState::Created {
            job.state = JobState::Running;
            job.started_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn fail(&self, job_id: Uuid, reason: impl Into<String>) -> AppResult<()> {
        let handle = self.job_handle(job_id)?;
        let mut job = handle.lock_unpoisoned();
        if !job.state.is_terminal() {
            job.state = JobState::Failed;
            job.finished_at = Some(Utc::now());
            job.admission_warnings.push(reason.into());
        }
        Ok(())
    }

    pub fn snapshot(&self, job_id: Uuid) -> AppResult<JobSnapshot> {
        let handle = self.job_handle(job_id)?;
        let job = handle.lock_unpoisoned();
        Ok(JobSnapshot { job: job.clone() })
    }

    /// Acquire the job's lock, apply `mutator`, then recompute counters and
    /// derived state (spec §4.4 `update_task`). Returns `true` when this
    /// call transitioned the job to `COMPLETED`.
    pub fn update_task<F>(&self, job_id: Uuid, task_id: Uuid, mutator: F) -> AppResult<bool>
    where
        F: FnOnce(&mut crate::domain::FileTask, bool),
    {
        let handle = self.job_handle(job_id)?;
        let mut job = handle.lock_unpoisoned();
        let is_cancelled = job.is_cancelled();
        let task = job
            .tasks
            .iter_mut()
            .find(|t| t.task_id == task_id)
            .ok_or_else(|| AppError::internal(format!("task {task_id} not found in job {job_id}")))?;
        mutator(task, is_cancelled);

        recompute_counters(&mut job);

        let became_completed = job.counters.completed == job.counters.total
            && job.state == JobState::Running
            && !is_cancelled;
        if became_completed {
            job.state = JobState::Completed;
            job.finished_at = Some(Utc::now());
        } else if is_cancelled
            && job.counters.completed == job.counters.total
            && job.state == JobState::Running
        {
            job.state = JobState::Cancelled;
            job.finished_at = Some(Utc::now());
        }
        Ok(became_completed)
    }

    pub fn set_current_file_hint(&self, job_id: Uuid, hint: Option<String>) -> AppResult<()> {
        let handle = self.job_handle(job_id)?;
        handle.lock_unpoisoned().current_file_hint = hint;
        Ok(())
    }

    /// Atomically transition `RUNNING -> CANCELLED`; idempotent in terminal
    /// states (spec §4.4 `cancel`, §8 invariant 6).
    ///
    /// Tasks not yet claimed by a worker (`PENDING`) are drained to
    /// `SKIPPED_CANCEL` synchronously here, rather than left for a worker
    /// thread to notice the cancellation flag — a job backed by a paused
    /// (zero-worker) pool would otherwise never leave `RUNNING`. `RUNNING`
    /// tasks already in flight are left for their worker to finish and
    /// discard via the checkpoints in `worker::process_one`.
    pub fn cancel(&self, job_id: Uuid) -> AppResult<JobState> {
        let handle = self.job_handle(job_id)?;
        let mut job = handle.lock_unpoisoned();
        let prior = job.state;
        if !job.state.is_terminal() {
            job.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
            if job.state == JobState::Created {
                job.state = JobState::Cancelled;
                job.finished_at = Some(Utc::now());
            } else {
                let now = Utc::now();
                for task in job.tasks.iter_mut() {
                    if task.state == TaskState::Pending {
                        task.state = TaskState::SkippedCancel;
                        task.finished_at = Some(now);
                    }
                }
                recompute_counters(&mut job);
                if job.counters.completed == job.counters.total {
                    job.state = JobState::Cancelled;
                    job.finished_at = Some(now);
                }
            }
        }
        Ok(prior)
    }

    pub fn list_active(&self) -> Vec<Uuid> {
        self.jobs
            .lock_unpoisoned()
            .iter()
            .filter(|(_, h)| !h.lock_unpoisoned().state.is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn list_all(&self) -> Vec<JobSnapshot> {
        self.jobs
            .lock_unpoisoned()
            .values()
            .map(|h| JobSnapshot {
                job: h.lock_unpoisoned().clone(),
            })
            .collect()
    }

    /// Remove terminal-state jobs older than `max_age` (spec §4.4 `reap`).
    pub fn reap(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut guard = self.jobs.lock_unpoisoned();
        let to_remove: Vec<Uuid> = guard
            .iter()
            .filter(|(_, h)| {
                let job = h.lock_unpoisoned();
                job.state.is_terminal() && job.finished_at.map(|f| f < cutoff).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        let count = to_remove.len();
        for id in &to_remove {
            guard.remove(id);
        }
        count
    }
}

fn recompute_counters(job: &mut Job) {
    let mut counters = JobCounters {
        total: job.tasks.len(),
        ..Default::default()
    };
    for task in &job.tasks {
        match task.state {
            TaskState::Succeeded => {
                counters.succeeded += 1;
                counters.completed += 1;
            }
            TaskState::Failed => {
                counters.failed += 1;
                counters.completed += 1;
            }
            TaskState::SkippedCancel => {
                counters.skipped += 1;
                counters.completed += 1;
            }
            TaskState::Pending | TaskState::Running => {}
        }
    }
    job.counters = counters;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskState;

    fn admitted(name: &str) -> AdmittedFile {
        AdmittedFile {
            filename: name.to_string(),
            bytes: Arc::new(vec![1, 2, 3]),
        }
    }

    #[test]
    fn create_and_snapshot_round_trip() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job(
            ProcessingOptions::default(),
            vec![admitted("a.png"), admitted("b.png")],
        );
        let snap = registry.snapshot(job_id).unwrap();
        assert_eq!(snap.job.counters.total, 2);
        assert_eq!(snap.job.state, JobState::Created);
    }

    #[test]
    fn snapshot_of_unknown_job_is_not_found() {
        let registry = JobRegistry::new();
        let err = registry.snapshot(Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::JobNotFound);
    }

    #[test]
    fn update_task_completes_job_when_all_tasks_terminal() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job(ProcessingOptions::default(), vec![admitted("a.png")]);
        registry.start(job_id).unwrap();
        let task_id = registry.snapshot(job_id).unwrap().job.tasks[0].task_id;

        let completed = registry
            .update_task(job_id, task_id, |task, _cancelled| {
                task.state = TaskState::Succeeded;
            })
            .unwrap();

        assert!(completed);
        let snap = registry.snapshot(job_id).unwrap();
        assert_eq!(snap.job.state, JobState::Completed);
        assert_eq!(snap.job.counters.succeeded, 1);
        assert!(snap.job.counters.is_consistent());
    }

    #[test]
    fn cancel_is_idempotent() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job(ProcessingOptions::default(), vec![admitted("a.png")]);
        registry.start(job_id).unwrap();
        let first = registry.cancel(job_id).unwrap();
        assert_eq!(first, JobState::Running);
        // The task was still PENDING, so cancel() drained it synchronously
        // and the job is already CANCELLED by the time this call returns.
        let snap = registry.snapshot(job_id).unwrap();
        assert_eq!(snap.job.state, JobState::Cancelled);
        assert_eq!(snap.job.tasks[0].state, TaskState::SkippedCancel);

        let second = registry.cancel(job_id).unwrap();
        assert_eq!(second, JobState::Cancelled);
    }

    #[test]
    fn cancel_drains_pending_tasks_without_a_worker() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job(
            ProcessingOptions::default(),
            vec![admitted("a.png"), admitted("b.png"), admitted("c.png")],
        );
        registry.start(job_id).unwrap();

        registry.cancel(job_id).unwrap();

        let snap = registry.snapshot(job_id).unwrap();
        assert_eq!(snap.job.state, JobState::Cancelled);
        assert!(snap.job.tasks.iter().all(|t| t.state == TaskState::SkippedCancel));
        assert_eq!(snap.job.counters.skipped, 3);
        assert!(snap.job.counters.is_consistent());
    }

    #[test]
    fn reap_removes_old_terminal_jobs_only() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job(ProcessingOptions::default(), vec![admitted("a.png")]);
        registry.start(job_id).unwrap();
        let task_id = registry.snapshot(job_id).unwrap().job.tasks[0].task_id;
        registry
            .update_task(job_id, task_id, |task, _| task.state = TaskState::Succeeded)
            .unwrap();

        let removed = registry.reap(chrono::Duration::hours(1));
        assert_eq!(removed, 0, "job just finished, should not be reaped yet");

        let removed = registry.reap(chrono::Duration::seconds(-1));
        assert_eq!(removed, 1);
        assert!(registry.snapshot(job_id).is_err());
    }
}
