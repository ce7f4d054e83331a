//! Error types for the silencer crate.

use thiserror::Error;

/// Errors that can occur in the silence engine.
#[derive(Debug, Error)]
pub enum SilenceError {
    /// Input failed validation before reaching storage.
    #[error("invalid {field}: {reason}")]
    Validation {
        /// The offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Silence with the given ID was not found.
    #[error("silence not found: {id}")]
    NotFound {
        /// The silence ID that was not found.
        id: String,
    },

    /// A silence with the given ID already exists.
    #[error("silence already exists: {id}")]
    AlreadyExists {
        /// The duplicate silence ID.
        id: String,
    },

    /// Optimistic-lock mismatch; the caller must re-fetch and retry.
    #[error("silence {id} was modified concurrently")]
    Conflict {
        /// The silence ID whose token no longer matches.
        id: String,
    },

    /// Storage could not be reached or the statement failed.
    #[error("storage unavailable: {reason}")]
    Unavailable {
        /// The underlying failure.
        reason: String,
    },

    /// Operation is not allowed in the manager's current lifecycle state.
    #[error("invalid manager state: expected {expected}, found {actual}")]
    InvalidState {
        /// The state required by the operation.
        expected: String,
        /// The state the manager was in.
        actual: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SilenceError {
    /// Shorthand for a [`SilenceError::Validation`].
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`SilenceError::NotFound`].
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Returns true if retrying the same call later may succeed.
    ///
    /// Conflicts are retryable only after re-reading the silence.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Conflict { .. })
    }

    /// HTTP-equivalent status code for the transport layer.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::Serialization(_) => 400,
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. } | Self::Conflict { .. } => 409,
            Self::Unavailable { .. } | Self::InvalidState { .. } => 500,
        }
    }
}

impl From<sqlx::Error> for SilenceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Unavailable {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SilenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for silence operations.
pub type Result<T> = std::result::Result<T, SilenceError>;
