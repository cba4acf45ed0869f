//! Error types for Record Vault

use thiserror::Error;

use crate::chain::{ChainError, ChainType};
use crate::quota::QuotaDecision;
use crate::storage::StorageError;
use crate::upload::SessionStatus;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the upload workflow
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {upload_id} is closed ({status})")]
    SessionClosed {
        upload_id: String,
        status: SessionStatus,
    },

    #[error("Invalid part number {part_number} (expected 1..={total_parts})")]
    InvalidPartNumber { part_number: u32, total_parts: u32 },

    #[error("Upload incomplete, missing parts: {missing:?}")]
    IncompleteUpload { upload_id: String, missing: Vec<u32> },

    #[error("File hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("No healthy node for logical node {0}")]
    NoHealthyNode(String),

    #[error("Quota exceeded: {}", .0.reason())]
    QuotaExceeded(Box<QuotaDecision>),

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(ChainType),

    #[error("Part {part_number} could not be stored on {logic_node} after {attempts} attempts: {message}")]
    ChunkWriteFailed {
        part_number: u32,
        logic_node: String,
        attempts: u32,
        message: String,
    },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code for the transport layer
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionClosed { .. } => "SESSION_CLOSED",
            Self::InvalidPartNumber { .. } => "INVALID_PART_NUMBER",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::HashMismatch { .. } => "HASH_MISMATCH",
            Self::NoHealthyNode(_) => "NO_HEALTHY_NODE",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            Self::ChunkWriteFailed { .. } => "CHUNK_WRITE_FAILED",
            Self::Chain(e) => e.kind().code(),
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the same call may succeed later without the caller changing it
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoHealthyNode(_)
            | Self::LedgerUnavailable(_)
            | Self::ChunkWriteFailed { .. }
            | Self::Storage(_)
            | Self::Database(_) => true,
            Self::Chain(e) => e.kind().is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_retryability() {
        let missing = Error::IncompleteUpload {
            upload_id: "u1".to_string(),
            missing: vec![2],
        };
        assert_eq!(missing.code(), "INCOMPLETE_UPLOAD");
        assert!(!missing.is_retryable());
        assert_eq!(missing.to_string(), "Upload incomplete, missing parts: [2]");

        let placement = Error::NoHealthyNode("logic-a".to_string());
        assert!(placement.is_retryable());

        let ledger = Error::Chain(ChainError::Timeout {
            chain: ChainType::LocalFisco,
            operation: "storeFile",
        });
        assert_eq!(ledger.code(), "CHAIN_TIMEOUT");
        assert!(ledger.is_retryable());
    }
}
