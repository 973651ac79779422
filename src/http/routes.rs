//! HTTP handlers and router composition (spec §6.1), built the way
//! `ob-poc-web::main` composes its `axum::Router` with a `CorsLayer` and a
//! `TraceLayer` over a typed `AppState`.

use super::state::AppState;
use super::{snapshot_json, ws};
use crate::error::{AppError, AppResult};
use crate::options::ProcessingOptions;
use crate::scheduler::RawFile;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/convert/to-base64", post(convert_to_base64))
        .route("/api/convert/to-base64-advanced", post(convert_to_base64_advanced))
        .route("/api/convert/from-base64", post(convert_from_base64))
        .route("/api/validate-base64", post(validate_base64))
        .route("/api/convert/batch-start", post(batch_start))
        .route("/api/convert/batch-progress/:job_id", get(batch_progress))
        .route("/api/convert/batch-cancel/:job_id", delete(batch_cancel))
        .route("/api/convert/batch-status", get(batch_status))
        .route("/api/convert/batch-cleanup", post(batch_cleanup))
        .route("/api/cache/status", get(cache_status))
        .route("/api/cache/clear", delete(cache_clear))
        .route("/api/security/scan", post(security_scan))
        .route("/socket.io/", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn rate_limit_gate(state: &AppState, client_id: &str) -> AppResult<()> {
    let result = state.rate_limiter.check(client_id, 1.0);
    if result.allowed {
        Ok(())
    } else {
        Err(AppError::rate_limited(format!(
            "retry after {:.1}s",
            result.retry_after_seconds
        )))
    }
}

async fn extract_single_file(multipart: &mut Multipart) -> AppResult<(String, Vec<u8>)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::input_invalid(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::input_invalid(format!("failed reading file field: {e}")))?;
            return Ok((filename, bytes.to_vec()));
        }
    }
    Err(AppError::input_invalid("missing required multipart field `file`"))
}

struct BatchMultipart {
    files: Vec<RawFile>,
    options: ProcessingOptions,
}

async fn extract_batch_multipart(mut multipart: Multipart) -> AppResult<BatchMultipart> {
    let mut files = Vec::new();
    let mut options = ProcessingOptions::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::input_invalid(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("files") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let declared_mime = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::input_invalid(format!("failed reading files field: {e}")))?;
                files.push(RawFile {
                    filename,
                    bytes: bytes.to_vec(),
                    declared_mime,
                });
            }
            Some("options") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::input_invalid(format!("failed reading options field: {e}")))?;
                // Unknown keys are ignored with a warning rather than
                // rejected (spec §9 "fixed strongly-typed option record").
                options = serde_json::from_str(&text)
                    .map_err(|e| AppError::input_invalid(format!("invalid options JSON: {e}")))?;
            }
            _ => {}
        }
    }
    Ok(BatchMultipart { files, options })
}

#[derive(Debug, Serialize)]
struct SimpleConvertResponse {
    base64: String,
    format: String,
    size: [u32; 2],
    file_size: usize,
}

async fn convert_to_base64(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    rate_limit_gate(&state, "anonymous")?;
    let (_filename, bytes) = extract_single_file(&mut multipart).await?;
    let options = ProcessingOptions::default();
    // Decoding/re-encoding is CPU-bound; keep it off the tokio reactor thread
    // (spec §5 "mixed concurrency model").
    let (out, metadata) = tokio::task::spawn_blocking(move || crate::codec::convert(&bytes, &options))
        .await
        .map_err(|e| AppError::internal(format!("codec task panicked: {e}")))??;
    let body = SimpleConvertResponse {
        base64: base64::engine::general_purpose::STANDARD.encode(&out),
        format: metadata.produced_format,
        size: [metadata.width, metadata.height],
        file_size: metadata.byte_size,
    };
    Ok(Json(body).into_response())
}

#[derive(Debug, Serialize)]
struct AdvancedConvertResponse {
    base64: String,
    format: String,
    size: [u32; 2],
    file_size: usize,
    original_format: String,
    original_size: [u32; 2],
    processed_format: String,
    processed_size: [u32; 2],
    processing_options: ProcessingOptions,
}

async fn convert_to_base64_advanced(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    rate_limit_gate(&state, "anonymous")?;
    let mut multipart = multipart;
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut options = ProcessingOptions::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::input_invalid(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::input_invalid(format!("failed reading file field: {e}")))?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("options") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::input_invalid(format!("failed reading options field: {e}")))?;
                options = serde_json::from_str(&text)
                    .map_err(|e| AppError::input_invalid(format!("invalid options JSON: {e}")))?;
            }
            _ => {}
        }
    }
    let (_filename, bytes) = file.ok_or_else(|| AppError::input_invalid("missing required multipart field `file`"))?;

    // Probing and decoding are both CPU-bound; run them together off the
    // tokio reactor thread (spec §5 "mixed concurrency model").
    let convert_options = options.clone();
    let (original_meta, out, metadata) = tokio::task::spawn_blocking(move || -> AppResult<_> {
        let original_meta = crate::codec::probe(&bytes)?;
        let (out, metadata) = crate::codec::convert(&bytes, &convert_options)?;
        Ok((original_meta, out, metadata))
    })
    .await
    .map_err(|e| AppError::internal(format!("codec task panicked: {e}")))??;
    let body = AdvancedConvertResponse {
        base64: base64::engine::general_purpose::STANDARD.encode(&out),
        format: metadata.produced_format.clone(),
        size: [metadata.width, metadata.height],
        file_size: metadata.byte_size,
        original_format: original_meta.original_format,
        original_size: [original_meta.width, original_meta.height],
        processed_format: metadata.produced_format,
        processed_size: [metadata.width, metadata.height],
        processing_options: options,
    };
    Ok(Json(body).into_response())
}

#[derive(Debug, Deserialize)]
struct FromBase64Request {
    base64: String,
    format: Option<crate::options::TargetFormat>,
}

async fn convert_from_base64(
    State(state): State<AppState>,
    Json(req): Json<FromBase64Request>,
) -> Result<Response, AppError> {
    rate_limit_gate(&state, "anonymous")?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.base64.as_bytes())
        .map_err(|e| AppError::input_invalid(format!("invalid base64: {e}")))?;
    let content_type = req
        .format
        .map(|f| f.content_type())
        .unwrap_or("application/octet-stream");
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        bytes,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct ValidateBase64Request {
    base64: String,
}

#[derive(Debug, Serialize)]
struct ValidateBase64Response {
    valid: bool,
    format: Option<String>,
    size: Option<[u32; 2]>,
    mode: Option<String>,
    error: Option<String>,
}

async fn validate_base64(Json(req): Json<ValidateBase64Request>) -> Json<ValidateBase64Response> {
    let response = match base64::engine::general_purpose::STANDARD.decode(req.base64.as_bytes()) {
        Err(e) => ValidateBase64Response {
            valid: false,
            format: None,
            size: None,
            mode: None,
            error: Some(format!("invalid base64: {e}")),
        },
        Ok(bytes) => match crate::codec::probe(&bytes) {
            Ok(meta) => ValidateBase64Response {
                valid: true,
                format: Some(meta.original_format),
                size: Some([meta.width, meta.height]),
                mode: Some("RGBA".into()),
                error: None,
            },
            Err(err) => ValidateBase64Response {
                valid: false,
                format: None,
                size: None,
                mode: None,
                error: Some(err.message),
            },
        },
    };
    Json(response)
}

#[derive(Debug, Serialize)]
struct BatchStartResponse {
    queue_id: Option<Uuid>,
    total_files: usize,
    status: &'static str,
    message: String,
    admitted: Vec<crate::scheduler::AdmissionReport>,
}

async fn batch_start(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    rate_limit_gate(&state, "anonymous")?;
    let parsed = extract_batch_multipart(multipart).await?;
    let total_requested = parsed.files.len();
    // Admission runs the Validator's deep scan and fingerprints every file;
    // both are CPU-bound, so cross into the core off the reactor thread
    // (spec §5 "mixed concurrency model").
    let scheduler = state.scheduler.clone();
    let outcome = tokio::task::spawn_blocking(move || scheduler.start_batch(parsed.options, parsed.files))
        .await
        .map_err(|e| AppError::internal(format!("batch admission task panicked: {e}")))??;

    let (status, message) = match outcome.job_id {
        Some(_) => ("queued", "batch accepted".to_string()),
        None => ("rejected", "no files passed admission".to_string()),
    };

    Ok((
        StatusCode::OK,
        Json(BatchStartResponse {
            queue_id: outcome.job_id,
            total_files: total_requested,
            status,
            message,
            admitted: outcome.admitted,
        }),
    )
        .into_response())
}

async fn batch_progress(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let snapshot = state.scheduler.progress(job_id)?;
    Ok(Json(snapshot_json(&snapshot.job)))
}

#[derive(Debug, Serialize)]
struct BatchCancelResponse {
    queue_id: Uuid,
    status: crate::domain::JobState,
    message: &'static str,
}

async fn batch_cancel(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<BatchCancelResponse>, AppError> {
    let prior = state.scheduler.cancel(job_id)?;
    let snapshot = state.scheduler.progress(job_id)?;
    let message = if prior.is_terminal() {
        "job was already terminal"
    } else {
        "cancellation requested"
    };
    Ok(Json(BatchCancelResponse {
        queue_id: job_id,
        status: snapshot.job.state,
        message,
    }))
}

async fn batch_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let all = state.scheduler.list_all();
    let active = state.scheduler.list_active();
    let all_queues: Vec<_> = all.iter().map(|s| snapshot_json(&s.job)).collect();
    Json(serde_json::json!({
        "active_tasks": active.len(),
        "all_queues": all_queues,
        "statistics": {
            "total_jobs": all.len(),
            "active_jobs": active.len(),
        },
        "timestamp": chrono::Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
struct BatchCleanupRequest {
    max_age_hours: Option<i64>,
}

async fn batch_cleanup(
    State(state): State<AppState>,
    Json(req): Json<BatchCleanupRequest>,
) -> Json<serde_json::Value> {
    let max_age = chrono::Duration::hours(req.max_age_hours.unwrap_or(state.config.server.job_retention_hours));
    let cleaned_queues = state.scheduler.cleanup(max_age);
    Json(serde_json::json!({
        "cleaned_tasks": cleaned_queues,
        "cleaned_queues": cleaned_queues,
        "cleaned_tracking": cleaned_queues,
        "message": format!("removed {cleaned_queues} terminal job(s)"),
    }))
}

async fn cache_status(State(state): State<AppState>) -> Json<crate::cache::CacheStats> {
    Json(state.cache.stats())
}

async fn cache_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (entries_removed, freed_bytes) = state.cache.clear();
    Json(serde_json::json!({
        "entries_removed": entries_removed,
        "space_freed_mb": freed_bytes as f64 / (1024.0 * 1024.0),
    }))
}

async fn security_scan(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<crate::validator::ValidationResult>, AppError> {
    rate_limit_gate(&state, "anonymous")?;
    let (_filename, bytes) = extract_single_file(&mut multipart).await?;
    Ok(Json(state.validator.validate(&bytes, None)))
}
