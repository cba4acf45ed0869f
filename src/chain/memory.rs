//! In-process ledger
//!
//! Keeps file records, shares and transactions in memory. Used for
//! development and tests, with switches for health, latency and failures.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::upload::{compute_hash, normalize_hash};

use super::adapter::{ensure_share_usable, require_non_empty, validate_expiry, validate_hashes, ChainAdapter};
use super::error::ChainError;
use super::types::{
    ChainFileDetail, ChainFileInfo, ChainReceipt, ChainShareInfo, ChainStatus, ChainTransaction,
    ChainType,
};

const CHAIN: ChainType = ChainType::Memory;

#[derive(Default)]
struct LedgerState {
    /// Record key -> file, per uploader, in anchoring order
    files: HashMap<String, Vec<ChainFileDetail>>,
    shares: HashMap<String, ChainShareInfo>,
    user_shares: HashMap<String, Vec<String>>,
    transactions: HashMap<String, ChainTransaction>,
    block_number: u64,
    healthy: bool,
    /// Pending injected `store_file` failures
    failing_stores: u32,
    store_delay: Option<Duration>,
    clock_offset: ChronoDuration,
}

impl LedgerState {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    /// Mine one transaction into a new block
    fn commit(&mut self, from: &str, input: String) -> ChainReceipt {
        self.block_number += 1;
        let hash = compute_hash(format!("{}:{}:{}", self.block_number, from, input).as_bytes());

        self.transactions.insert(
            hash.clone(),
            ChainTransaction {
                hash: hash.clone(),
                chain_id: Some("memory".to_string()),
                group_id: None,
                from: Some(from.to_string()),
                to: None,
                input: Some(input),
                block_number: Some(self.block_number),
                gas_used: None,
                success: true,
            },
        );

        ChainReceipt {
            transaction_hash: hash,
            file_hash: None,
            share_code: None,
            block_number: Some(self.block_number),
        }
    }
}

#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        // Genesis block so a fresh ledger reports healthy
        let state = LedgerState {
            healthy: true,
            block_number: 1,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    /// Fail the next `count` anchoring calls with an I/O error
    pub fn fail_next_stores(&self, count: u32) {
        self.state.lock().failing_stores = count;
    }

    /// Delay every anchoring call
    pub fn set_store_delay(&self, delay: Option<Duration>) {
        self.state.lock().store_delay = delay;
    }

    /// Move the ledger's clock forward, e.g. past a share expiry
    pub fn advance_clock(&self, by: ChronoDuration) {
        self.state.lock().clock_offset += by;
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().files.values().map(Vec::len).sum()
    }

    pub fn block_number(&self) -> u64 {
        self.state.lock().block_number
    }
}

#[async_trait]
impl ChainAdapter for InMemoryLedger {
    fn chain_type(&self) -> ChainType {
        CHAIN
    }

    async fn store_file(
        &self,
        uploader: &str,
        file_name: &str,
        content: &str,
        param: &str,
    ) -> Result<ChainReceipt, ChainError> {
        const OP: &str = "storeFile";
        require_non_empty(CHAIN, OP, "uploader", uploader)?;
        require_non_empty(CHAIN, OP, "file name", file_name)?;

        let delay = self.state.lock().store_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if !state.healthy {
            return Err(ChainError::Unreachable {
                chain: CHAIN,
                operation: OP,
                message: "ledger is offline".to_string(),
            });
        }
        if state.failing_stores > 0 {
            state.failing_stores -= 1;
            return Err(ChainError::io(CHAIN, OP, "injected failure"));
        }

        let file_hash = compute_hash(content.as_bytes());
        let detail = ChainFileDetail {
            uploader: uploader.to_string(),
            file_name: file_name.to_string(),
            param: param.to_string(),
            content: content.to_string(),
            file_hash: file_hash.clone(),
            upload_timestamp: state.now().timestamp_millis(),
        };

        let files = state.files.entry(uploader.to_string()).or_default();
        match files.iter_mut().find(|f| f.file_hash == file_hash) {
            Some(existing) => *existing = detail,
            None => files.push(detail),
        }

        let receipt = state.commit(uploader, format!("{}({})", OP, file_hash));
        Ok(ChainReceipt {
            file_hash: Some(file_hash),
            ..receipt
        })
    }

    async fn get_user_files(&self, uploader: &str) -> Result<Vec<ChainFileInfo>, ChainError> {
        require_non_empty(CHAIN, "getUserFiles", "uploader", uploader)?;

        let state = self.state.lock();
        Ok(state
            .files
            .get(uploader)
            .map(|files| {
                files
                    .iter()
                    .map(|f| ChainFileInfo {
                        file_name: f.file_name.clone(),
                        file_hash: f.file_hash.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_file(&self, uploader: &str, file_hash: &str) -> Result<ChainFileDetail, ChainError> {
        const OP: &str = "getFile";
        require_non_empty(CHAIN, OP, "uploader", uploader)?;
        let hash = normalize_hash(file_hash);

        let state = self.state.lock();
        state
            .files
            .get(uploader)
            .and_then(|files| files.iter().find(|f| f.file_hash == hash))
            .cloned()
            .ok_or_else(|| ChainError::not_found(CHAIN, OP, format!("file {}", hash)))
    }

    async fn delete_files(
        &self,
        uploader: &str,
        file_hashes: &[String],
    ) -> Result<ChainReceipt, ChainError> {
        const OP: &str = "deleteFiles";
        require_non_empty(CHAIN, OP, "uploader", uploader)?;
        let hashes = validate_hashes(CHAIN, OP, file_hashes)?;

        let mut state = self.state.lock();
        if let Some(files) = state.files.get_mut(uploader) {
            files.retain(|f| !hashes.contains(&f.file_hash));
        }
        Ok(state.commit(uploader, format!("{}({})", OP, hashes.join(","))))
    }

    async fn share_files(
        &self,
        uploader: &str,
        file_hashes: &[String],
        expire_minutes: u32,
    ) -> Result<ChainReceipt, ChainError> {
        const OP: &str = "shareFiles";
        require_non_empty(CHAIN, OP, "uploader", uploader)?;
        let hashes = validate_hashes(CHAIN, OP, file_hashes)?;
        validate_expiry(CHAIN, OP, expire_minutes)?;

        let mut state = self.state.lock();
        let owned = state.files.get(uploader);
        if let Some(missing) = hashes
            .iter()
            .find(|h| !owned.is_some_and(|files| files.iter().any(|f| &f.file_hash == *h)))
        {
            return Err(ChainError::not_found(CHAIN, OP, format!("file {}", missing)));
        }

        let share_code = uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        let expire_at = state.now() + ChronoDuration::minutes(i64::from(expire_minutes));
        state.shares.insert(
            share_code.clone(),
            ChainShareInfo {
                share_code: share_code.clone(),
                uploader: uploader.to_string(),
                file_hashes: hashes,
                expire_timestamp: expire_at.timestamp_millis(),
                is_valid: true,
            },
        );
        state
            .user_shares
            .entry(uploader.to_string())
            .or_default()
            .push(share_code.clone());

        let receipt = state.commit(uploader, format!("{}({})", OP, share_code));
        Ok(ChainReceipt {
            share_code: Some(share_code),
            ..receipt
        })
    }

    async fn get_shared_files(&self, share_code: &str) -> Result<ChainShareInfo, ChainError> {
        const OP: &str = "getSharedFiles";
        let share = self.get_share_info(share_code).await?;
        let now = self.state.lock().now();
        ensure_share_usable(CHAIN, OP, share, now)
    }

    async fn cancel_share(&self, share_code: &str) -> Result<ChainReceipt, ChainError> {
        const OP: &str = "cancelShare";
        require_non_empty(CHAIN, OP, "share code", share_code)?;

        let mut state = self.state.lock();
        let uploader = match state.shares.get_mut(share_code) {
            Some(share) => {
                share.is_valid = false;
                share.uploader.clone()
            }
            None => return Err(ChainError::not_found(CHAIN, OP, format!("share {}", share_code))),
        };
        Ok(state.commit(&uploader, format!("{}({})", OP, share_code)))
    }

    async fn get_user_share_codes(&self, uploader: &str) -> Result<Vec<String>, ChainError> {
        require_non_empty(CHAIN, "getUserShareCodes", "uploader", uploader)?;
        Ok(self
            .state
            .lock()
            .user_shares
            .get(uploader)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_share_info(&self, share_code: &str) -> Result<ChainShareInfo, ChainError> {
        const OP: &str = "getShareInfo";
        require_non_empty(CHAIN, OP, "share code", share_code)?;

        self.state
            .lock()
            .shares
            .get(share_code)
            .cloned()
            .ok_or_else(|| ChainError::not_found(CHAIN, OP, format!("share {}", share_code)))
    }

    async fn get_chain_status(&self) -> ChainStatus {
        let state = self.state.lock();
        if !state.healthy {
            return ChainStatus::unhealthy(CHAIN);
        }

        ChainStatus {
            chain_type: CHAIN,
            block_number: Some(state.block_number),
            transaction_count: Some(state.transactions.len() as u64),
            failed_transaction_count: Some(0),
            healthy: true,
            last_update_time: state.now(),
        }
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<ChainTransaction, ChainError> {
        const OP: &str = "getTransaction";
        let hash = normalize_hash(tx_hash);

        self.state
            .lock()
            .transactions
            .get(&hash)
            .cloned()
            .ok_or_else(|| ChainError::not_found(CHAIN, OP, format!("transaction {}", hash)))
    }
}
