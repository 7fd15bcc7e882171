use crate::{
    models::job::{ProblemDetail, ProblemKind},
    services::{document_table::TableError, http_source::HttpError, storage_clients::StorageError},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Errors raised while moving or restoring objects.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unable to determine size of `{url}`: {reason}")]
    Probe { url: String, reason: String },
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("locator type `{0}` is not supported")]
    UnsupportedLocator(String),
    #[error("no way to transfer `{from}` to `{to}`")]
    UnsupportedTransfer { from: String, to: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("operation cut short at the invocation deadline")]
    Aborted,
    /// Input or state rejected with a specific problem type.
    #[error("{title}: {detail}")]
    Rejected {
        kind: ProblemKind,
        title: String,
        detail: String,
    },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Http(#[from] HttpError),
}

pub type CopyResult<T> = Result<T, CopyError>;

impl CopyError {
    pub fn transfer(msg: impl Into<String>) -> Self {
        CopyError::Transfer(msg.into())
    }

    pub fn rejected(kind: ProblemKind, title: impl Into<String>, detail: impl Into<String>) -> Self {
        CopyError::Rejected {
            kind,
            title: title.into(),
            detail: detail.into(),
        }
    }

    /// Problem type used when this error fails a job outside of a copy run.
    pub fn problem_kind(&self) -> ProblemKind {
        match self {
            CopyError::Rejected { kind, .. } => *kind,
            CopyError::InvalidInput(_) => ProblemKind::InvalidInput,
            CopyError::UnsupportedLocator(_) => ProblemKind::LocatorTypeNotSupported,
            CopyError::Configuration(_)
            | CopyError::Probe { .. }
            | CopyError::Transfer(_)
            | CopyError::UnsupportedTransfer { .. }
            | CopyError::Aborted
            | CopyError::Table(_)
            | CopyError::Storage(_)
            | CopyError::Http(_) => ProblemKind::GenericFailure,
        }
    }

    /// Problem document recorded on a job failed by this error.
    pub fn to_problem(&self) -> ProblemDetail {
        match self {
            CopyError::Rejected {
                kind,
                title,
                detail,
            } => ProblemDetail::new(*kind, title.clone(), Some(detail.clone())),
            CopyError::InvalidInput(_) => {
                ProblemDetail::new(self.problem_kind(), "Invalid job input", Some(self.to_string()))
            }
            CopyError::UnsupportedLocator(_) => ProblemDetail::new(
                self.problem_kind(),
                "Provided input locator type is not supported",
                Some(self.to_string()),
            ),
            _ => ProblemDetail::new(
                self.problem_kind(),
                "Unexpected error occurred",
                Some(self.to_string()),
            ),
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<TableError> for AppError {
    fn from(err: TableError) -> Self {
        AppError::internal(err.to_string())
    }
}
