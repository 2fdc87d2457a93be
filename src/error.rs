use gatecore::store::error::StoreError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("persistence write timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} already exists")]
    AlreadyExists(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{op} failed: {message}")]
    UpstreamFailure { op: &'static str, message: String },
    #[error("{0} timed out")]
    Timeout(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("storage error: {0}")]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

impl GatewayError {
    /// Wraps a protocol client error. Only the top-level message is kept.
    pub fn upstream(op: &'static str, err: anyhow::Error) -> Self {
        Self::UpstreamFailure {
            op,
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidState(_) => "invalid_state",
            Self::UpstreamFailure { .. } => "upstream_failure",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidInput(_) => "invalid_input",
            Self::Store(_) | Self::Persistence(_) => "storage",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) | Self::InvalidState(_) => 409,
            Self::InvalidInput(_) => 400,
            Self::UpstreamFailure { .. } => 502,
            Self::Timeout(_) => 504,
            Self::Cancelled => 499,
            Self::Store(_) | Self::Persistence(_) => 500,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            Self::Store(_) | Self::Persistence(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            kind: self.kind(),
            message,
        }
    }
}
