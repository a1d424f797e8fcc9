//! Error types for the live feed
//!
//! Error taxonomy using thiserror

use thiserror::Error;

/// Errors reported by the document store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Document not found: {path}")]
    NotFound { path: String },

    #[error("Invalid document: {reason}")]
    InvalidDocument { reason: String },
}

/// Errors from submitting a rating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RatingError {
    #[error("Invalid score: {0} (must be between 1 and 5)")]
    InvalidScore(i64),

    #[error("Note too long: {len} characters, max {max}")]
    NoteTooLong { len: usize, max: usize },

    #[error("Not signed in")]
    SignedOut,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure reported by a subscription's cancel capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cancel failed: {reason}")]
pub struct CancelError {
    pub reason: String,
}

impl CancelError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_error_display() {
        let err = RatingError::InvalidScore(7);
        assert_eq!(err.to_string(), "Invalid score: 7 (must be between 1 and 5)");
    }

    #[test]
    fn test_rating_error_from_store_error() {
        let err: RatingError = StoreError::PermissionDenied.into();
        assert!(matches!(err, RatingError::Store(StoreError::PermissionDenied)));
    }

    #[test]
    fn test_store_error_unavailable_carries_reason() {
        let err = StoreError::Unavailable {
            reason: "socket closed".to_string(),
        };
        assert!(err.to_string().contains("socket closed"));
    }
}
