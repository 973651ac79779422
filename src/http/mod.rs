//! Edge Adapters: HTTP + WebSocket translation layer over the core (spec
//! §4.8). Thin by design — every handler's job is input translation, an
//! invocation of Scheduler/Cache/Validator/RateLimiter, and error-kind to
//! status-code mapping; no business logic lives here.

pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;

use crate::domain::Job;
use crate::error::AppError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Bit-exact batch-progress projection (spec §6.1 "Batch progress response
/// fields"). Shared by the HTTP polling endpoint, the WebSocket
/// `batch_progress`/`queue_status` events, and the Progress Bus payloads so
/// every transport reports the same shape.
pub fn snapshot_json(job: &Job) -> serde_json::Value {
    let current_file_progress = if job.state.is_terminal() { 1.0 } else { 0.0 };

    let mut body = serde_json::json!({
        "queue_id": job.job_id.to_string(),
        "total_files": job.counters.total,
        "completed_files": job.counters.completed,
        "current_file": job.current_file_hint,
        "estimated_time_remaining": job.eta_seconds(),
        "status": job.state,
        "error_count": job.counters.failed,
        "start_time": job.started_at,
        "current_file_progress": current_file_progress,
        "progress_percentage": job.progress_percentage(),
        "success_rate": job.success_rate(),
    });

    if job.state.is_terminal() {
        let total_processing_time = job
            .finished_at
            .zip(job.started_at)
            .map(|(end, start)| (end - start).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let average_processing_time = if job.counters.completed > 0 {
            total_processing_time / job.counters.completed as f64
        } else {
            0.0
        };
        let successful_results: Vec<_> = job
            .tasks
            .iter()
            .filter(|t| t.state == crate::domain::TaskState::Succeeded)
            .map(|t| {
                serde_json::json!({
                    "task_id": t.task_id.to_string(),
                    "filename": t.filename,
                    "metadata": t.outcome.metadata,
                    "base64": t.outcome.artifact_base64,
                })
            })
            .collect();
        let failed_file_details: Vec<_> = job
            .tasks
            .iter()
            .filter(|t| t.state == crate::domain::TaskState::Failed)
            .map(|t| {
                serde_json::json!({
                    "task_id": t.task_id.to_string(),
                    "filename": t.filename,
                    "error_code": t.outcome.error_code,
                    "error_message": t.outcome.error_message,
                })
            })
            .collect();

        if let serde_json::Value::Object(ref mut map) = body {
            map.insert("successful_files".into(), job.counters.succeeded.into());
            map.insert("failed_files".into(), job.counters.failed.into());
            map.insert("average_processing_time".into(), average_processing_time.into());
            map.insert("total_processing_time".into(), total_processing_time.into());
            map.insert("successful_results".into(), successful_results.into());
            map.insert("failed_file_details".into(), failed_file_details.into());
        }
    }

    body
}

/// `AppError -> axum::response::Response`, mapping the stable error-kind
/// taxonomy to the HTTP status table (spec §7 "Propagation"). `JOB_ALREADY_
/// TERMINAL` is deliberately not an error status per spec.md §7: callers
/// that need that idempotent behavior construct their own 200 response
/// rather than going through this conversion.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind().status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body: crate::error::ErrorBody = (&self).into();
        (status, Json(body)).into_response()
    }
}
