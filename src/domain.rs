//! Job Registry data model: File Task, Job, and their state machines
//! (spec §3, §4.4).

use crate::codec::ImageMetadata;
use crate::options::{Fingerprint, ProcessingOptions};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    SkippedCancel,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub metadata: Option<ImageMetadata>,
    pub artifact_base64: Option<String>,
    pub error_code: Option<&'static str>,
    pub error_message: Option<String>,
}

impl TaskOutcome {
    pub fn none() -> Self {
        TaskOutcome {
            metadata: None,
            artifact_base64: None,
            error_code: None,
            error_message: None,
        }
    }
}

/// One unit of work within a Job (spec §3 "File Task").
#[derive(Debug, Clone, Serialize)]
pub struct FileTask {
    pub task_id: Uuid,
    pub filename: String,
    #[serde(skip)]
    pub source_bytes: std::sync::Arc<Vec<u8>>,
    pub fingerprint: Fingerprint,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct JobCounters {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl JobCounters {
    /// Invariant 1 (spec §8): `completed == succeeded + failed + skipped`.
    pub fn is_consistent(&self) -> bool {
        self.completed == self.succeeded + self.failed + self.skipped && self.completed <= self.total
    }
}

/// A named collection of File Tasks sharing one set of Processing Options
/// (spec §3 "Job"). Owned exclusively by the Job Registry; every mutation
/// goes through `registry::JobRegistry::update_task`/`cancel`.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: Uuid,
    pub options: ProcessingOptions,
    pub tasks: Vec<FileTask>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: JobCounters,
    pub current_file_hint: Option<String>,
    pub admission_warnings: Vec<String>,
    #[serde(skip)]
    pub cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Job {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// `progress_percentage` derived field (spec §4.4 "recomputes derived
    /// fields").
    pub fn progress_percentage(&self) -> f64 {
        if self.counters.total == 0 {
            return 0.0;
        }
        (self.counters.completed as f64 / self.counters.total as f64) * 100.0
    }

    pub fn success_rate(&self) -> f64 {
        if self.counters.completed == 0 {
            return 0.0;
        }
        (self.counters.succeeded as f64 / self.counters.completed as f64) * 100.0
    }

    /// `eta = avg_task_time * (total - completed)` (spec §4.4). A hint, never
    /// authoritative.
    pub fn eta_seconds(&self) -> Option<f64> {
        let started_at = self.started_at?;
        if self.counters.completed == 0 {
            return None;
        }
        let elapsed = (Utc::now() - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let avg = elapsed / self.counters.completed as f64;
        Some(avg * (self.counters.total - self.counters.completed) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_counters_consistency_invariant() {
        let ok = JobCounters {
            total: 5,
            completed: 3,
            succeeded: 2,
            failed: 1,
            skipped: 0,
        };
        assert!(ok.is_consistent());

        let bad = JobCounters {
            total: 5,
            completed: 3,
            succeeded: 2,
            failed: 2,
            skipped: 0,
        };
        assert!(!bad.is_consistent());
    }

    #[test]
    fn job_state_terminal_classification() {
        assert!(!JobState::Created.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }
}
