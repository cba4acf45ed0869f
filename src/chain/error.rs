//! Ledger errors

use thiserror::Error;

use super::types::ChainType;

/// Failure of one ledger operation, tagged with the backend and operation name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("[{chain}] {operation} timed out")]
    Timeout {
        chain: ChainType,
        operation: &'static str,
    },

    #[error("[{chain}] {operation} failed, ledger unreachable: {message}")]
    Unreachable {
        chain: ChainType,
        operation: &'static str,
        message: String,
    },

    #[error("[{chain}] {operation} I/O error: {message}")]
    Io {
        chain: ChainType,
        operation: &'static str,
        message: String,
    },

    #[error("[{chain}] {operation} rejected: {message}")]
    Rejected {
        chain: ChainType,
        operation: &'static str,
        message: String,
    },

    #[error("[{chain}] {operation}: {what} not found")]
    NotFound {
        chain: ChainType,
        operation: &'static str,
        what: String,
    },

    #[error("[{chain}] {operation}: invalid input: {message}")]
    InvalidInput {
        chain: ChainType,
        operation: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainErrorKind {
    Timeout,
    Unreachable,
    Io,
    Rejected,
    NotFound,
    InvalidInput,
}

impl ChainErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::Timeout => "CHAIN_TIMEOUT",
            Self::Unreachable => "CHAIN_UNREACHABLE",
            Self::Io => "CHAIN_IO_ERROR",
            Self::Rejected => "CHAIN_REJECTED",
            Self::NotFound => "CHAIN_NOT_FOUND",
            Self::InvalidInput => "CHAIN_INVALID_INPUT",
        }
    }

    /// Transport-level failures that may clear on their own
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::Unreachable | Self::Io)
    }
}

impl ChainError {
    pub fn kind(&self) -> ChainErrorKind {
        match self {
            Self::Timeout { .. } => ChainErrorKind::Timeout,
            Self::Unreachable { .. } => ChainErrorKind::Unreachable,
            Self::Io { .. } => ChainErrorKind::Io,
            Self::Rejected { .. } => ChainErrorKind::Rejected,
            Self::NotFound { .. } => ChainErrorKind::NotFound,
            Self::InvalidInput { .. } => ChainErrorKind::InvalidInput,
        }
    }

    pub fn chain(&self) -> ChainType {
        match self {
            Self::Timeout { chain, .. }
            | Self::Unreachable { chain, .. }
            | Self::Io { chain, .. }
            | Self::Rejected { chain, .. }
            | Self::NotFound { chain, .. }
            | Self::InvalidInput { chain, .. } => *chain,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Self::Timeout { operation, .. }
            | Self::Unreachable { operation, .. }
            | Self::Io { operation, .. }
            | Self::Rejected { operation, .. }
            | Self::NotFound { operation, .. }
            | Self::InvalidInput { operation, .. } => operation,
        }
    }

    /// Classify a transport failure
    pub fn from_reqwest(chain: ChainType, operation: &'static str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { chain, operation }
        } else if err.is_connect() {
            Self::Unreachable {
                chain,
                operation,
                message: err.to_string(),
            }
        } else {
            Self::Io {
                chain,
                operation,
                message: err.to_string(),
            }
        }
    }

    pub fn io(chain: ChainType, operation: &'static str, message: impl Into<String>) -> Self {
        Self::Io {
            chain,
            operation,
            message: message.into(),
        }
    }

    pub fn rejected(chain: ChainType, operation: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            chain,
            operation,
            message: message.into(),
        }
    }

    pub fn not_found(chain: ChainType, operation: &'static str, what: impl Into<String>) -> Self {
        Self::NotFound {
            chain,
            operation,
            what: what.into(),
        }
    }

    pub fn invalid_input(chain: ChainType, operation: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            chain,
            operation,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_backend_prefix() {
        let err = ChainError::rejected(ChainType::BsnFisco, "storeFile", "out of gas");
        assert_eq!(err.to_string(), "[BSN FISCO] storeFile rejected: out of gas");
        assert_eq!(err.kind().code(), "CHAIN_REJECTED");
        assert!(!err.kind().is_transient());
        assert_eq!(err.chain(), ChainType::BsnFisco);
        assert_eq!(err.operation(), "storeFile");
    }

    #[test]
    fn test_transient_kinds() {
        let timeout = ChainError::Timeout {
            chain: ChainType::LocalFisco,
            operation: "getFile",
        };
        assert!(timeout.kind().is_transient());
        assert!(ChainError::io(ChainType::Memory, "getFile", "eof").kind().is_transient());
        assert!(!ChainError::not_found(ChainType::Memory, "getFile", "file").kind().is_transient());
    }
}
