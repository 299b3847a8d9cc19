//! Error taxonomy shared by the dispatch queue and the artifact packager.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("packaging failed: {0}")]
    Packaging(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
}

impl DispatchError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// HTTP status class for the produced API surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Packaging(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<r2d2::Error> for DispatchError {
    fn from(e: r2d2::Error) -> Self {
        Self::StoreUnavailable(format!("connection pool: {e}"))
    }
}

impl From<rusqlite::Error> for DispatchError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::StoreUnavailable(format!("corrupt document: {e}"))
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(e: std::io::Error) -> Self {
        Self::Packaging(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
