//! Crate-wide error taxonomy
//!
//! Module errors (`UploadError`, `LedgerError`, `ChannelError`, ...) stay close to
//! the code that raises them and convert into [`LifelineError`] at the component
//! boundary. Transport and storage details never travel further up than that.

use thiserror::Error;

use crate::evidence::StreamType;

/// Top-level error returned by every public component operation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifelineError {
    /// Bad input. Never retried by the core.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate session, already-settled incident, rejected deletion
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller must resend the listed chunk indexes
    #[error("Incomplete upload: stream {stream_type} missing {missing_indexes:?}")]
    IncompleteUpload {
        stream_type: StreamType,
        missing_indexes: Vec<u32>,
    },

    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Non-fatal audit flag; the record is kept
    #[error("Tamper suspected on evidence {evidence_id}: {mismatches:?}")]
    TamperSuspected {
        evidence_id: String,
        mismatches: Vec<StreamType>,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LifelineError {
    /// Stable machine-readable kind, used in HTTP error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            LifelineError::Validation(_) => "validation",
            LifelineError::NotFound(_) => "not_found",
            LifelineError::Conflict(_) => "conflict",
            LifelineError::IncompleteUpload { .. } => "incomplete_upload",
            LifelineError::ChannelUnavailable(_) => "channel_unavailable",
            LifelineError::TamperSuspected { .. } => "tamper_suspected",
            LifelineError::Storage(_) => "storage",
            LifelineError::Internal(_) => "internal",
        }
    }
}

/// Result alias for component operations
pub type Result<T> = std::result::Result<T, LifelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_upload_message_lists_indexes() {
        let err = LifelineError::IncompleteUpload {
            stream_type: StreamType::Audio,
            missing_indexes: vec![2, 5],
        };
        assert_eq!(err.kind(), "incomplete_upload");
        assert!(err.to_string().contains("[2, 5]"));
        assert!(err.to_string().contains("audio"));
    }
}
