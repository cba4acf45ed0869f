//! Ledger Adapter
//!
//! Uniform interface over the interchangeable ledger backends. Exactly one
//! backend is active per process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::upload::normalize_hash;

use super::error::ChainError;
use super::types::{
    ChainFileDetail, ChainFileInfo, ChainReceipt, ChainShareInfo, ChainStatus, ChainTransaction,
    ChainType,
};

/// Longest share lifetime: 30 days
pub const MAX_SHARE_EXPIRE_MINUTES: u32 = 43_200;

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_type(&self) -> ChainType;

    /// Anchor a file record. `content` is the serialized chunk manifest.
    async fn store_file(
        &self,
        uploader: &str,
        file_name: &str,
        content: &str,
        param: &str,
    ) -> Result<ChainReceipt, ChainError>;

    async fn get_user_files(&self, uploader: &str) -> Result<Vec<ChainFileInfo>, ChainError>;

    async fn get_file(&self, uploader: &str, file_hash: &str) -> Result<ChainFileDetail, ChainError>;

    async fn delete_files(
        &self,
        uploader: &str,
        file_hashes: &[String],
    ) -> Result<ChainReceipt, ChainError>;

    /// Share files for `expire_minutes`; the receipt carries the share code
    async fn share_files(
        &self,
        uploader: &str,
        file_hashes: &[String],
        expire_minutes: u32,
    ) -> Result<ChainReceipt, ChainError>;

    /// Files of a share that is still valid and unexpired
    async fn get_shared_files(&self, share_code: &str) -> Result<ChainShareInfo, ChainError>;

    async fn cancel_share(&self, share_code: &str) -> Result<ChainReceipt, ChainError>;

    async fn get_user_share_codes(&self, uploader: &str) -> Result<Vec<String>, ChainError>;

    /// Share metadata regardless of validity
    async fn get_share_info(&self, share_code: &str) -> Result<ChainShareInfo, ChainError>;

    /// Never fails; an unreachable ledger reports `healthy: false`
    async fn get_chain_status(&self) -> ChainStatus;

    async fn get_transaction(&self, tx_hash: &str) -> Result<ChainTransaction, ChainError>;

    async fn is_healthy(&self) -> bool {
        let status = self.get_chain_status().await;
        status.healthy && status.block_number.is_some_and(|block| block > 0)
    }
}

// ============================================================================
// Input Validation
// ============================================================================

pub(crate) fn require_non_empty(
    chain: ChainType,
    operation: &'static str,
    field: &str,
    value: &str,
) -> Result<(), ChainError> {
    if value.trim().is_empty() {
        return Err(ChainError::invalid_input(
            chain,
            operation,
            format!("{} must not be empty", field),
        ));
    }
    Ok(())
}

/// Normalize a non-empty list of file hashes
pub(crate) fn validate_hashes(
    chain: ChainType,
    operation: &'static str,
    file_hashes: &[String],
) -> Result<Vec<String>, ChainError> {
    if file_hashes.is_empty() {
        return Err(ChainError::invalid_input(
            chain,
            operation,
            "file hash list must not be empty",
        ));
    }

    file_hashes
        .iter()
        .map(|hash| {
            let normalized = normalize_hash(hash);
            if normalized.is_empty() {
                Err(ChainError::invalid_input(chain, operation, "file hash must not be empty"))
            } else {
                Ok(normalized)
            }
        })
        .collect()
}

pub(crate) fn validate_expiry(
    chain: ChainType,
    operation: &'static str,
    expire_minutes: u32,
) -> Result<(), ChainError> {
    if expire_minutes == 0 || expire_minutes > MAX_SHARE_EXPIRE_MINUTES {
        return Err(ChainError::invalid_input(
            chain,
            operation,
            format!(
                "expiry must be between 1 and {} minutes, got {}",
                MAX_SHARE_EXPIRE_MINUTES, expire_minutes
            ),
        ));
    }
    Ok(())
}

/// Reject cancelled or expired shares
pub(crate) fn ensure_share_usable(
    chain: ChainType,
    operation: &'static str,
    share: ChainShareInfo,
    now: DateTime<Utc>,
) -> Result<ChainShareInfo, ChainError> {
    if !share.is_valid {
        return Err(ChainError::rejected(
            chain,
            operation,
            format!("share {} has been cancelled", share.share_code),
        ));
    }
    if share.is_expired_at(now) {
        return Err(ChainError::rejected(
            chain,
            operation,
            format!("share {} has expired", share.share_code),
        ));
    }
    Ok(share)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_hashes() {
        let chain = ChainType::Memory;
        assert!(validate_hashes(chain, "deleteFiles", &[]).is_err());
        assert!(validate_hashes(chain, "deleteFiles", &["0x".to_string()]).is_err());

        let normalized = validate_hashes(chain, "deleteFiles", &["0xABcd".to_string()]).unwrap();
        assert_eq!(normalized, ["abcd"]);
    }

    #[test]
    fn test_validate_expiry_bounds() {
        let chain = ChainType::Memory;
        assert!(validate_expiry(chain, "shareFiles", 0).is_err());
        assert!(validate_expiry(chain, "shareFiles", 1).is_ok());
        assert!(validate_expiry(chain, "shareFiles", MAX_SHARE_EXPIRE_MINUTES).is_ok());
        assert!(validate_expiry(chain, "shareFiles", MAX_SHARE_EXPIRE_MINUTES + 1).is_err());
    }

    #[test]
    fn test_ensure_share_usable() {
        let now = Utc::now();
        let share = ChainShareInfo {
            share_code: "S1".to_string(),
            uploader: "alice".to_string(),
            file_hashes: vec!["aa".to_string()],
            expire_timestamp: now.timestamp_millis() + 60_000,
            is_valid: true,
        };

        assert!(ensure_share_usable(ChainType::Memory, "getSharedFiles", share.clone(), now).is_ok());

        let cancelled = ChainShareInfo { is_valid: false, ..share.clone() };
        let err = ensure_share_usable(ChainType::Memory, "getSharedFiles", cancelled, now).unwrap_err();
        assert!(err.to_string().contains("cancelled"));

        let later = now + chrono::Duration::minutes(2);
        let err = ensure_share_usable(ChainType::Memory, "getSharedFiles", share, later).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }
}
