//! Error taxonomy for everything that can go wrong between a task
//! arriving and its fragment finishing.
//!
//! Every variant carries a short client-visible message. `status()` maps
//! boundary and validation failures to 4xx and execution or upstream
//! failures to 5xx; the HTTP layer renders them through `IntoResponse`.

use std::path::PathBuf;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The resolved path is not Root or a descendant of it.
    #[error("Access outside the data directory is not allowed: {path}")]
    PathEscape { path: String },

    #[error("File not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// The command contains a denylisted token.
    #[error("Command rejected: contains denied token '{token}' (deleting files is not allowed)")]
    Rejected { token: String },

    /// Subprocess exited nonzero. `diagnostic` is never empty.
    #[error("Command failed ({}): {diagnostic}", format_status(*status))]
    CommandExecution {
        status: Option<i32>,
        diagnostic: String,
    },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("LLM service error: {0}")]
    ExternalService(String),

    #[error("Fragment execution failed: {0}")]
    SandboxExecution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_status(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl SandboxError {
    /// HTTP status for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PathEscape { .. } | Self::Rejected { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ExternalService(_) => StatusCode::BAD_GATEWAY,
            Self::CommandExecution { .. } | Self::SandboxExecution(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathEscape { .. } => "path_escape",
            Self::NotFound { .. } => "not_found",
            Self::Rejected { .. } => "command_rejected",
            Self::CommandExecution { .. } => "command_failed",
            Self::Timeout { .. } => "timeout",
            Self::ExternalService(_) => "external_service",
            Self::SandboxExecution(_) => "sandbox_execution",
            Self::Io(_) => "internal",
        }
    }

    /// True when the caller caused the failure (4xx).
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        if self.is_client_error() {
            warn!("Request rejected: {self}");
        } else {
            error!("Request failed: {self}");
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
