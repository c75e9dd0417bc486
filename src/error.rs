//! Error Types for the TSS custody engine
//!
//! One root error for every operation the orchestrators and custody services
//! expose. Each variant maps to a stable code returned to callers.

use thiserror::Error;

use crate::keystore::KeystoreError;
use crate::storage::StorageError;
use crate::types::{ErrorResponse, NodeFailure};

/// Root error type
#[derive(Debug, Error)]
pub enum Error {
    /// Wallet or session does not belong to the caller
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Round request targets a stage that is not at the expected prior status
    #[error("stage sequence violation: {0}")]
    Sequence(String),

    /// Another writer advanced the stage first
    #[error("stage conflict: {0}")]
    Conflict(String),

    /// Not every wait slot for the requested step is filled
    #[error("incomplete round: missing {missing:?}")]
    IncompleteRound { missing: Vec<String> },

    /// The primitive aborted or a consistency check failed; terminal
    #[error("primitive failure: {0}")]
    Primitive(String),

    #[error("key share custody insufficient: {}", format_failures(.failures))]
    KeyshareInsufficient { failures: Vec<NodeFailure> },

    #[error("no active server keypair; provision one with rotate-keypair")]
    KeypairNotProvisioned,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

fn format_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(msg) | StorageError::Duplicate(msg) => Self::Conflict(msg),
            StorageError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Storage(other),
        }
    }
}

impl Error {
    pub fn sequence(msg: impl Into<String>) -> Self {
        Self::Sequence(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Sequence(_) => "STAGE_SEQUENCE",
            Error::Conflict(_) => "STAGE_CONFLICT",
            Error::IncompleteRound { .. } => "INCOMPLETE_ROUND",
            Error::Primitive(_) => "PRIMITIVE_FAILURE",
            Error::KeyshareInsufficient { .. } => "KEYSHARE_NODE_INSUFFICIENT",
            Error::KeypairNotProvisioned => "KEYPAIR_NOT_PROVISIONED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Storage(_) | Error::Keystore(_) | Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Transport-level failures the caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage(StorageError::Connection(_)) | Error::Storage(StorageError::Database(_))
        )
    }

    /// Caller-facing shape; internal failures are logged in full and
    /// returned without detail
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            Error::Storage(_) | Error::Keystore(_) | Error::Internal(_) => {
                tracing::error!(error = %self, "Internal error");
                ErrorResponse::new(self.code(), "internal error")
            }
            Error::KeyshareInsufficient { failures } => {
                ErrorResponse::new(self.code(), "key share custody not confirmed by all nodes")
                    .with_details(format_failures(failures))
            }
            Error::IncompleteRound { missing } => {
                ErrorResponse::new(self.code(), "round messages incomplete")
                    .with_details(missing.join(", "))
            }
            other => ErrorResponse::new(other.code(), other.to_string()),
        }
    }
}

/// Result type alias using the root error
pub type Result<T> = std::result::Result<T, Error>;
