//! Stable error taxonomy shared by every core component (spec §7).
//!
//! Every fallible core operation returns `Result<T, AppError>`. Edge adapters
//! map `AppError::kind()` to an HTTP status and a JSON `error_code`; nothing
//! downstream ever matches on `Display` text.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InputInvalid,
    UnsupportedFormat,
    FileTooLarge,
    SecurityRejected,
    CodecFailed,
    CacheUnavailable,
    QueueFull,
    RateLimited,
    JobNotFound,
    JobAlreadyTerminal,
    Internal,
}

impl ErrorKind {
    /// HTTP status code per spec §6 "Status codes".
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::InputInvalid => 400,
            ErrorKind::UnsupportedFormat => 415,
            ErrorKind::FileTooLarge => 413,
            ErrorKind::SecurityRejected => 400,
            ErrorKind::CodecFailed => 400,
            ErrorKind::CacheUnavailable => 500,
            ErrorKind::QueueFull => 503,
            ErrorKind::RateLimited => 429,
            ErrorKind::JobNotFound => 404,
            ErrorKind::JobAlreadyTerminal => 200,
            ErrorKind::Internal => 500,
        }
    }

    pub fn as_code_str(self) -> &'static str {
        match self {
            ErrorKind::InputInvalid => "INPUT_INVALID",
            ErrorKind::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorKind::FileTooLarge => "FILE_TOO_LARGE",
            ErrorKind::SecurityRejected => "SECURITY_REJECTED",
            ErrorKind::CodecFailed => "CODEC_FAILED",
            ErrorKind::CacheUnavailable => "CACHE_UNAVAILABLE",
            ErrorKind::QueueFull => "QUEUE_FULL",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::JobNotFound => "JOB_NOT_FOUND",
            ErrorKind::JobAlreadyTerminal => "JOB_ALREADY_TERMINAL",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind_str}: {message}", kind_str = self.kind.as_code_str())]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

macro_rules! err_ctor {
    ($name:ident, $kind:ident) => {
        pub fn $name(message: impl Into<String>) -> AppError {
            AppError::new(ErrorKind::$kind, message)
        }
    };
}

err_ctor!(input_invalid, InputInvalid);
err_ctor!(unsupported_format, UnsupportedFormat);
err_ctor!(file_too_large, FileTooLarge);
err_ctor!(security_rejected, SecurityRejected);
err_ctor!(codec_failed, CodecFailed);
err_ctor!(cache_unavailable, CacheUnavailable);
err_ctor!(queue_full, QueueFull);
err_ctor!(rate_limited, RateLimited);
err_ctor!(job_not_found, JobNotFound);
err_ctor!(job_already_terminal, JobAlreadyTerminal);
err_ctor!(internal, Internal);

pub type AppResult<T> = Result<T, AppError>;

/// Wire shape for `{error_code, message}` bodies (spec §7 "User-visible behavior").
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error_code: &'static str,
    pub message: String,
}

impl From<&AppError> for ErrorBody {
    fn from(err: &AppError) -> Self {
        ErrorBody {
            error_code: err.kind.as_code_str(),
            message: err.message.clone(),
        }
    }
}
