//! Sharing contract bindings
//!
//! Typed wrappers around the file storage and sharing contract functions
//! exposed through a [`ContractGateway`].

use chrono::Utc;
use serde_json::{json, Value};

use super::adapter::{ensure_share_usable, require_non_empty, validate_expiry, validate_hashes};
use super::error::ChainError;
use super::gateway::{value_bool, value_hash, value_str, value_u64, ContractGateway, TransactionOutcome};
use super::types::{ChainFileDetail, ChainFileInfo, ChainShareInfo, ChainType};

#[derive(Clone)]
pub struct SharingContract {
    gateway: ContractGateway,
}

impl SharingContract {
    pub fn new(gateway: ContractGateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &ContractGateway {
        &self.gateway
    }

    fn chain(&self) -> ChainType {
        self.gateway.chain_type()
    }

    /// Returns the transaction and the ledger's record key
    pub async fn store_file(
        &self,
        uploader: &str,
        file_name: &str,
        content: &str,
        param: &str,
    ) -> Result<(TransactionOutcome, String), ChainError> {
        const OP: &str = "storeFile";
        require_non_empty(self.chain(), OP, "uploader", uploader)?;
        require_non_empty(self.chain(), OP, "file name", file_name)?;

        let outcome = self
            .gateway
            .transact(OP, vec![json!(file_name), json!(uploader), json!(content), json!(param)])
            .await?;

        let file_hash = outcome
            .values
            .first()
            .and_then(value_hash)
            .ok_or_else(|| ChainError::io(self.chain(), OP, "failed to extract file hash"))?;

        Ok((outcome, file_hash))
    }

    pub async fn get_user_files(&self, uploader: &str) -> Result<Vec<ChainFileInfo>, ChainError> {
        const OP: &str = "getUserFiles";
        require_non_empty(self.chain(), OP, "uploader", uploader)?;

        let values = self.gateway.call(OP, vec![json!(uploader)]).await?;
        Ok(parse_user_files(&values))
    }

    pub async fn get_file(&self, uploader: &str, file_hash: &str) -> Result<ChainFileDetail, ChainError> {
        const OP: &str = "getFile";
        require_non_empty(self.chain(), OP, "uploader", uploader)?;
        let hash = validate_hashes(self.chain(), OP, &[file_hash.to_string()])?.remove(0);

        let values = self
            .gateway
            .call(OP, vec![json!(uploader), json!(format!("0x{}", hash))])
            .await?;
        parse_file_detail(self.chain(), &values, &hash)
    }

    pub async fn delete_files(
        &self,
        uploader: &str,
        file_hashes: &[String],
    ) -> Result<TransactionOutcome, ChainError> {
        const OP: &str = "deleteFiles";
        require_non_empty(self.chain(), OP, "uploader", uploader)?;
        let hashes = validate_hashes(self.chain(), OP, file_hashes)?;

        self.gateway
            .transact(OP, vec![json!(uploader), json!(prefixed(&hashes))])
            .await
    }

    /// Returns the transaction and the issued share code
    pub async fn share_files(
        &self,
        uploader: &str,
        file_hashes: &[String],
        expire_minutes: u32,
    ) -> Result<(TransactionOutcome, String), ChainError> {
        const OP: &str = "shareFiles";
        require_non_empty(self.chain(), OP, "uploader", uploader)?;
        let hashes = validate_hashes(self.chain(), OP, file_hashes)?;
        validate_expiry(self.chain(), OP, expire_minutes)?;

        let outcome = self
            .gateway
            .transact(OP, vec![json!(uploader), json!(prefixed(&hashes)), json!(expire_minutes)])
            .await?;

        let share_code = outcome
            .values
            .first()
            .and_then(value_str)
            .filter(|code| !code.is_empty())
            .ok_or_else(|| ChainError::io(self.chain(), OP, "failed to extract share code"))?;

        Ok((outcome, share_code))
    }

    pub async fn get_share_info(&self, share_code: &str) -> Result<ChainShareInfo, ChainError> {
        const OP: &str = "getShareInfo";
        require_non_empty(self.chain(), OP, "share code", share_code)?;

        let values = self.gateway.call(OP, vec![json!(share_code)]).await?;
        parse_share_info(self.chain(), &values, share_code)
    }

    pub async fn get_shared_files(&self, share_code: &str) -> Result<ChainShareInfo, ChainError> {
        let share = self.get_share_info(share_code).await?;
        ensure_share_usable(self.chain(), "getSharedFiles", share, Utc::now())
    }

    pub async fn cancel_share(&self, share_code: &str) -> Result<TransactionOutcome, ChainError> {
        const OP: &str = "cancelShare";
        require_non_empty(self.chain(), OP, "share code", share_code)?;
        self.gateway.transact(OP, vec![json!(share_code)]).await
    }

    pub async fn get_user_share_codes(&self, uploader: &str) -> Result<Vec<String>, ChainError> {
        const OP: &str = "getUserShareCodes";
        require_non_empty(self.chain(), OP, "uploader", uploader)?;

        let values = self.gateway.call(OP, vec![json!(uploader)]).await?;
        Ok(parse_share_codes(&values))
    }
}

fn prefixed(hashes: &[String]) -> Vec<String> {
    hashes.iter().map(|h| format!("0x{}", h)).collect()
}

// ============================================================================
// Return Value Decoding
// ============================================================================

/// `[[ [fileName, fileHash], ... ]]`
pub(crate) fn parse_user_files(values: &[Value]) -> Vec<ChainFileInfo> {
    let Some(files) = values.first().and_then(Value::as_array) else {
        return Vec::new();
    };

    files
        .iter()
        .filter_map(Value::as_array)
        .filter(|entry| entry.len() >= 2)
        .filter_map(|entry| {
            Some(ChainFileInfo {
                file_name: value_str(&entry[0]).unwrap_or_default(),
                file_hash: value_hash(&entry[1])?,
            })
        })
        .collect()
}

/// `[[uploader, fileName, param, content, fileHash, uploadTimeNanos]]`
pub(crate) fn parse_file_detail(
    chain: ChainType,
    values: &[Value],
    file_hash: &str,
) -> Result<ChainFileDetail, ChainError> {
    let info = values
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| ChainError::not_found(chain, "getFile", format!("file {}", file_hash)))?;

    if info.len() < 6 {
        return Err(ChainError::io(chain, "getFile", "invalid file info structure"));
    }

    let upload_nanos = value_u64(&info[5]).unwrap_or(0);
    Ok(ChainFileDetail {
        uploader: value_str(&info[0]).unwrap_or_default(),
        file_name: value_str(&info[1]).unwrap_or_default(),
        param: value_str(&info[2]).unwrap_or_default(),
        content: value_str(&info[3]).unwrap_or_default(),
        file_hash: file_hash.to_string(),
        upload_timestamp: i64::try_from(upload_nanos / 1_000_000).unwrap_or(i64::MAX),
    })
}

/// `[uploader, [fileHash, ...], expireTimeMillis, isValid]`
pub(crate) fn parse_share_info(
    chain: ChainType,
    values: &[Value],
    share_code: &str,
) -> Result<ChainShareInfo, ChainError> {
    if values.is_empty() {
        return Err(ChainError::not_found(chain, "getShareInfo", format!("share {}", share_code)));
    }
    if values.len() < 4 {
        return Err(ChainError::io(chain, "getShareInfo", "invalid return value"));
    }

    let file_hashes = values[1]
        .as_array()
        .map(|hashes| hashes.iter().filter_map(value_hash).collect())
        .unwrap_or_default();

    Ok(ChainShareInfo {
        share_code: share_code.to_string(),
        uploader: value_str(&values[0]).unwrap_or_default(),
        file_hashes,
        expire_timestamp: value_u64(&values[2])
            .and_then(|t| i64::try_from(t).ok())
            .unwrap_or(0),
        is_valid: value_bool(&values[3]).unwrap_or(false),
    })
}

/// `[[shareCode, ...]]`
pub(crate) fn parse_share_codes(values: &[Value]) -> Vec<String> {
    values
        .first()
        .and_then(Value::as_array)
        .map(|codes| {
            codes
                .iter()
                .filter_map(value_str)
                .filter(|code| !code.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::error::ChainErrorKind;

    const CHAIN: ChainType = ChainType::BsnFisco;

    #[test]
    fn test_parse_user_files_skips_malformed_entries() {
        let values = vec![json!([
            ["report.pdf", "0xAA01"],
            ["missing-hash"],
            ["empty.bin", ""],
            ["notes.txt", [187, 2]]
        ])];

        let files = parse_user_files(&values);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_name, "report.pdf");
        assert_eq!(files[0].file_hash, "aa01");
        assert_eq!(files[1].file_hash, "bb02");

        assert!(parse_user_files(&[]).is_empty());
    }

    #[test]
    fn test_parse_file_detail() {
        let values = vec![json!([
            "alice",
            "report.pdf",
            "{\"uploadId\":\"u1\"}",
            "{\"parts\":[]}",
            "0xaa",
            "1700000000000000000"
        ])];

        let detail = parse_file_detail(CHAIN, &values, "aa").unwrap();
        assert_eq!(detail.uploader, "alice");
        assert_eq!(detail.content, "{\"parts\":[]}");
        assert_eq!(detail.upload_timestamp, 1_700_000_000_000);

        let err = parse_file_detail(CHAIN, &[], "aa").unwrap_err();
        assert_eq!(err.kind(), ChainErrorKind::NotFound);

        let err = parse_file_detail(CHAIN, &[json!(["alice"])], "aa").unwrap_err();
        assert_eq!(err.kind(), ChainErrorKind::Io);
    }

    #[test]
    fn test_parse_share_info_keeps_invalid_shares() {
        let values = vec![json!("alice"), json!(["0xAA", "0xBB"]), json!(1_700_000_000_000u64), json!(false)];

        let share = parse_share_info(CHAIN, &values, "CODE1").unwrap();
        assert_eq!(share.share_code, "CODE1");
        assert_eq!(share.file_hashes, ["aa", "bb"]);
        assert_eq!(share.expire_timestamp, 1_700_000_000_000);
        assert!(!share.is_valid);

        let err = parse_share_info(CHAIN, &[], "CODE1").unwrap_err();
        assert_eq!(err.kind(), ChainErrorKind::NotFound);
    }

    #[test]
    fn test_parse_share_codes() {
        let values = vec![json!(["A1", "", "B2"])];
        assert_eq!(parse_share_codes(&values), ["A1", "B2"]);
        assert!(parse_share_codes(&[json!("flat")]).is_empty());
    }
}
