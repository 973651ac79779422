//! Worker Pool: bounded-concurrency executor for per-file tasks (spec §4.3).
//!
//! Workers are OS threads pulling off a bounded channel, the same shape as
//! the teacher's thread-per-worker loop pulling off a `Mutex`-guarded queue
//! (`ffui_core::engine::worker::spawner::worker_loop`), except the bounded
//! channel itself gives us the `QUEUE_FULL` rejection for free via
//! `try_send` instead of an explicit backlog counter.

use crate::bus::{BusEvent, ProgressBus};
use crate::cache::CacheStore;
use crate::codec;
use crate::domain::{TaskOutcome, TaskState};
use crate::error::{AppError, AppResult};
use crate::registry::JobRegistry;
use base64::Engine as _;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

pub type TaskRef = (Uuid, Uuid);

pub struct WorkerPool {
    sender: Sender<TaskRef>,
    _workers: Vec<thread::JoinHandle<()>>,
}

struct WorkerContext {
    registry: Arc<JobRegistry>,
    cache: Arc<CacheStore>,
    bus: Arc<ProgressBus>,
}

impl WorkerPool {
    /// Spawn `worker_count` OS threads, each pulling from a shared bounded
    /// channel of backlog `max_backlog` (spec §4.3 "Shape"). `worker_count`
    /// is honored as given, including `0` — a pool with no workers accepts
    /// submissions up to `max_backlog` but never drains them; callers that
    /// want a functioning service must configure at least one worker
    /// (`config::ProcessingConfig::max_concurrent_files`).
    pub fn new(
        worker_count: usize,
        max_backlog: usize,
        registry: Arc<JobRegistry>,
        cache: Arc<CacheStore>,
        bus: Arc<ProgressBus>,
    ) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded::<TaskRef>(max_backlog);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let receiver: Receiver<TaskRef> = receiver.clone();
            let ctx = WorkerContext {
                registry: registry.clone(),
                cache: cache.clone(),
                bus: bus.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("imgflux-worker-{index}"))
                .spawn(move || worker_loop(receiver, ctx))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        WorkerPool {
            sender,
            _workers: workers,
        }
    }

    /// Non-blocking submission up to the configured backlog (spec §4.3).
    pub fn submit(&self, job_id: Uuid, task_id: Uuid) -> AppResult<()> {
        match self.sender.try_send((job_id, task_id)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AppError::queue_full("worker pool backlog is full")),
            Err(TrySendError::Disconnected(_)) => {
                Err(AppError::internal("worker pool has shut down"))
            }
        }
    }
}

fn worker_loop(receiver: Receiver<TaskRef>, ctx: WorkerContext) {
    while let Ok((job_id, task_id)) = receiver.recv() {
        process_one(&ctx, job_id, task_id);
    }
}

/// Per-task execution per spec §4.3 "Per-task execution" steps 1-7.
fn process_one(ctx: &WorkerContext, job_id: Uuid, task_id: Uuid) {
    let snapshot = match ctx.registry.snapshot(job_id) {
        Ok(s) => s,
        Err(_) => return, // job vanished (reaped) before this task ran
    };
    if snapshot.job.is_cancelled() {
        mark_skipped(ctx, job_id, task_id);
        return;
    }

    let task = match snapshot.job.tasks.iter().find(|t| t.task_id == task_id) {
        Some(t) => t.clone(),
        None => return,
    };

    let _ = ctx
        .registry
        .update_task(job_id, task_id, |t, _cancelled| {
            t.state = TaskState::Running;
            t.started_at = Some(chrono::Utc::now());
        });
    let _ = ctx
        .registry
        .set_current_file_hint(job_id, Some(task.filename.clone()));

    // Coarse cancellation checkpoint between marking RUNNING and invoking
    // the codec (spec §4.3 "Cancellation polling").
    if ctx.registry.snapshot(job_id).map(|s| s.job.is_cancelled()).unwrap_or(false) {
        mark_skipped(ctx, job_id, task_id);
        return;
    }

    let options = snapshot.job.options.clone();
    let source_bytes = task.source_bytes.clone();
    let fingerprint = task.fingerprint;

    let compute_result = ctx
        .cache
        .get_or_compute(fingerprint, || codec::convert(&source_bytes, &options));

    let job_cancelled = ctx.registry.snapshot(job_id).map(|s| s.job.is_cancelled()).unwrap_or(false);
    if job_cancelled {
        // spec §4.5 "A task arriving late with an outcome for a CANCELLED
        // job is recorded as SKIPPED_CANCEL ... the result is discarded but
        // cached" (the get_or_compute call above already wrote it to cache).
        mark_skipped(ctx, job_id, task_id);
        return;
    }

    let became_completed = match compute_result {
        Ok((bytes, metadata, _was_hit)) => {
            let artifact_base64 = base64::engine::general_purpose::STANDARD.encode(bytes.as_slice());
            ctx.registry
                .update_task(job_id, task_id, |t, _| {
                    t.state = TaskState::Succeeded;
                    t.finished_at = Some(chrono::Utc::now());
                    t.outcome = TaskOutcome {
                        metadata: Some(metadata),
                        artifact_base64: Some(artifact_base64),
                        error_code: None,
                        error_message: None,
                    };
                })
                .unwrap_or(false)
        }
        Err(err) => ctx
            .registry
            .update_task(job_id, task_id, |t, _| {
                t.state = TaskState::Failed;
                t.finished_at = Some(chrono::Utc::now());
                t.outcome = TaskOutcome {
                    metadata: None,
                    artifact_base64: None,
                    error_code: Some(err.kind().as_code_str()),
                    error_message: Some(err.message.clone()),
                };
            })
            .unwrap_or(false),
    };

    emit_file_processed(ctx, job_id, task_id);
    if became_completed {
        emit_terminal(ctx, job_id, BusEvent::BatchCompleted);
    } else {
        emit_progress(ctx, job_id);
    }
}

fn mark_skipped(ctx: &WorkerContext, job_id: Uuid, task_id: Uuid) {
    let became_completed = ctx
        .registry
        .update_task(job_id, task_id, |t, _| {
            if !matches!(t.state, TaskState::Succeeded | TaskState::Failed) {
                t.state = TaskState::SkippedCancel;
                t.finished_at = Some(chrono::Utc::now());
            }
        })
        .unwrap_or(false);
    emit_file_processed(ctx, job_id, task_id);

    let all_terminal = ctx
        .registry
        .snapshot(job_id)
        .map(|s| s.job.counters.completed == s.job.counters.total)
        .unwrap_or(false);
    if all_terminal {
        emit_terminal(ctx, job_id, BusEvent::BatchCancelled);
    } else if became_completed {
        emit_terminal(ctx, job_id, BusEvent::BatchCompleted);
    }
}

fn emit_file_processed(ctx: &WorkerContext, job_id: Uuid, task_id: Uuid) {
    let snapshot = match ctx.registry.snapshot(job_id) {
        Ok(s) => s,
        Err(_) => return,
    };
    if let Some(task) = snapshot.job.tasks.iter().find(|t| t.task_id == task_id) {
        ctx.bus.publish(
            job_id,
            BusEvent::FileProcessed(serde_json::json!({
                "queue_id": job_id.to_string(),
                "task_id": task_id.to_string(),
                "filename": task.filename,
                "state": task.state,
            })),
        );
    }
}

fn emit_progress(ctx: &WorkerContext, job_id: Uuid) {
    if let Ok(snapshot) = ctx.registry.snapshot(job_id) {
        ctx.bus.publish(
            job_id,
            BusEvent::BatchProgress(crate::http::snapshot_json(&snapshot.job)),
        );
    }
}

fn emit_terminal(ctx: &WorkerContext, job_id: Uuid, ctor: fn(serde_json::Value) -> BusEvent) {
    if let Ok(snapshot) = ctx.registry.snapshot(job_id) {
        ctx.bus
            .publish(job_id, ctor(crate::http::snapshot_json(&snapshot.job)));
    }
}
