use std::{io, path::PathBuf};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::format::MediaFormat;

/// Failure of a single engine invocation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{binary} is not installed or not on PATH")]
    NotInstalled { binary: String },
    #[error("could not run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
    #[error("engine timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("{message}")]
    Failed { message: String },
}

impl EngineError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Outcome taxonomy of the fetch-and-locate procedure.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("attempt {attempt} failed: {source}")]
    EngineAttemptFailed {
        attempt: usize,
        #[source]
        source: EngineError,
    },
    #[error("download failed after {attempts} attempt(s): {source}")]
    EngineExhausted {
        attempts: usize,
        #[source]
        source: EngineError,
    },
    #[error("No .{format} file found for {prefix}")]
    ArtifactNotFound { prefix: String, format: MediaFormat },
    #[error("could not remove scratch directory {}: {source}", path.display())]
    CleanupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("scratch directory error: {0}")]
    Scratch(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history store error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("history record has an invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("API_KEY must be set to a non-empty value")]
    MissingApiKey,
    #[error("invalid origin in ALLOWED_ORIGINS: {0}. Use values like https://example.com")]
    InvalidOrigin(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Unauthorized".to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(error: FetchError) -> Self {
        let message = error.to_string();
        match error {
            FetchError::UnsupportedFormat(_) => Self::bad_request(message),
            FetchError::EngineExhausted { .. } | FetchError::EngineAttemptFailed { .. } => {
                Self::bad_gateway(message)
            }
            FetchError::ArtifactNotFound { .. }
            | FetchError::CleanupFailed { .. }
            | FetchError::Scratch(_) => Self::internal(message),
        }
    }
}

impl From<HistoryError> for ApiError {
    fn from(error: HistoryError) -> Self {
        Self::internal(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}
