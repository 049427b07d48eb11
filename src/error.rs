//! Error types for the consensus engine.
//!
//! All errors are strongly typed using thiserror. Ordinary business
//! conditions (too few observations, a malformed observation) are not errors;
//! they surface as skip reasons and counters in result structs.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors raised while building domain values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Part number cannot be empty")]
    EmptyPartNumber,

    #[error("Conflict cannot be moved back to {status}")]
    InvalidReviewStatus {
        status: String,
    },

    #[error("Reviewer cannot be empty")]
    EmptyReviewer,
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path:?}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{message}")]
    Invalid {
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Top-level error type for the consensus engine.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The observation store or consensus sink cannot be reached at all.
    /// Fatal for the current run.
    #[error("Store unavailable, aborting run: {message}")]
    StoreUnavailable {
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ConsensusError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classifies a storage error, promoting connectivity failures to
    /// `StoreUnavailable`.
    #[must_use]
    pub fn from_storage(err: StorageError) -> Self {
        if err.is_unavailable() {
            Self::StoreUnavailable {
                message: err.to_string(),
            }
        } else {
            Self::Storage(err)
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this error must abort a batch run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Config(_))
    }

    /// Returns true if this is a rejected write or other per-part storage failure.
    #[must_use]
    pub const fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Result type alias for engine operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_missing_field() {
        let err = ValidationError::MissingField {
            field: "part_number".to_string(),
        };
        assert!(err.to_string().contains("part_number"));
    }

    #[test]
    fn test_config_error_invalid() {
        let err = ConfigError::invalid("dominance_threshold must be in (0, 1]");
        assert!(err.to_string().contains("dominance_threshold"));
    }

    #[test]
    fn test_from_storage_promotes_unavailable() {
        let err = ConsensusError::from_storage(StorageError::Unavailable("refused".to_string()));
        assert!(err.is_fatal());
        assert!(!err.is_persistence_failure());
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_from_storage_keeps_write_rejection() {
        let err =
            ConsensusError::from_storage(StorageError::WriteRejected("constraint".to_string()));
        assert!(!err.is_fatal());
        assert!(err.is_persistence_failure());
    }

    #[test]
    fn test_consensus_error_from_validation() {
        let err: ConsensusError = ValidationError::EmptyPartNumber.into();
        assert!(err.is_validation());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_internal() {
        let err = ConsensusError::internal("worker panicked");
        assert!(err.to_string().contains("worker panicked"));
    }
}
