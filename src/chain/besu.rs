//! Hyperledger Besu adapter (BSN)
//!
//! File operations go through the contract gateway. Node status, transaction
//! lookups and receipt confirmation use Ethereum JSON-RPC.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::ChainConfig;
use crate::upload::normalize_hash;

use super::adapter::{require_non_empty, ChainAdapter};
use super::contract::SharingContract;
use super::error::ChainError;
use super::gateway::{value_str, value_u64, ContractGateway, TransactionOutcome, BSN_APP_KEY_HEADER};
use super::types::{
    ChainFileDetail, ChainFileInfo, ChainReceipt, ChainShareInfo, ChainStatus, ChainTransaction,
    ChainType,
};

const CHAIN: ChainType = ChainType::BsnBesu;

// ============================================================================
// JSON-RPC Client
// ============================================================================

#[derive(Clone)]
pub struct JsonRpcClient {
    client: Client,
    url: String,
    app_key: Option<String>,
}

impl JsonRpcClient {
    pub fn new(url: &str, timeout: Duration, app_key: Option<String>) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::io(CHAIN, "connect", e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            app_key,
        })
    }

    pub async fn call(
        &self,
        operation: &'static str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.app_key {
            request = request.header(BSN_APP_KEY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChainError::from_reqwest(CHAIN, operation, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::io(
                CHAIN,
                operation,
                format!("{} returned HTTP {}", method, status),
            ));
        }

        let mut reply: Value = response
            .json()
            .await
            .map_err(|e| ChainError::from_reqwest(CHAIN, operation, &e))?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(value_str)
                .unwrap_or_else(|| error.to_string());
            return Err(ChainError::rejected(CHAIN, operation, message));
        }

        Ok(reply.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }
}

// ============================================================================
// Adapter
// ============================================================================

#[derive(Clone)]
pub struct BesuAdapter {
    contract: SharingContract,
    rpc: JsonRpcClient,
    receipt_poll_attempts: u32,
    receipt_poll_interval: Duration,
}

impl BesuAdapter {
    pub fn new(config: &ChainConfig) -> Result<Self, ChainError> {
        let rpc_url = config
            .rpc_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                ChainError::invalid_input(CHAIN, "connect", "CHAIN_RPC_URL is required for the Besu backend")
            })?;

        let app_key = config.app_key.clone().filter(|key| !key.is_empty());
        let rpc = JsonRpcClient::new(rpc_url, Duration::from_secs(config.timeout_secs), app_key)?;
        let gateway = ContractGateway::new(CHAIN, config)?;

        tracing::info!(
            chain = %CHAIN,
            gateway = %gateway.base_url(),
            rpc = %rpc_url,
            "Ledger adapter configured"
        );

        Ok(Self {
            contract: SharingContract::new(gateway),
            rpc,
            receipt_poll_attempts: config.receipt_poll_attempts.max(1),
            receipt_poll_interval: Duration::from_millis(config.receipt_poll_interval_ms),
        })
    }

    /// Poll until the transaction is mined, then require success
    async fn confirm(
        &self,
        operation: &'static str,
        outcome: TransactionOutcome,
    ) -> Result<ChainReceipt, ChainError> {
        let hash = format!("0x{}", outcome.transaction_hash);

        for attempt in 1..=self.receipt_poll_attempts {
            let receipt = self
                .rpc
                .call(operation, "eth_getTransactionReceipt", vec![json!(hash)])
                .await?;

            if !receipt.is_null() {
                if receipt.get("status").and_then(value_u64) != Some(1) {
                    return Err(ChainError::rejected(
                        CHAIN,
                        operation,
                        format!("transaction {} reverted", hash),
                    ));
                }

                return Ok(ChainReceipt {
                    transaction_hash: outcome.transaction_hash,
                    file_hash: None,
                    share_code: None,
                    block_number: receipt
                        .get("blockNumber")
                        .and_then(value_u64)
                        .or(outcome.block_number),
                });
            }

            tracing::debug!(
                operation = operation,
                transaction_hash = %hash,
                attempt = attempt,
                "Waiting for transaction receipt"
            );
            tokio::time::sleep(self.receipt_poll_interval).await;
        }

        tracing::warn!(
            operation = operation,
            transaction_hash = %hash,
            attempts = self.receipt_poll_attempts,
            "Transaction receipt not confirmed in time"
        );
        Err(ChainError::Timeout {
            chain: CHAIN,
            operation,
        })
    }

    async fn fetch_status(&self) -> Result<ChainStatus, ChainError> {
        let block = self
            .rpc
            .call("getChainStatus", "eth_blockNumber", Vec::new())
            .await?;

        Ok(ChainStatus {
            chain_type: CHAIN,
            block_number: value_u64(&block),
            transaction_count: None,
            failed_transaction_count: None,
            healthy: true,
            last_update_time: Utc::now(),
        })
    }
}

#[async_trait]
impl ChainAdapter for BesuAdapter {
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
        let (outcome, file_hash) = self
            .contract
            .store_file(uploader, file_name, content, param)
            .await?;
        let receipt = self.confirm("storeFile", outcome).await?;

        tracing::info!(
            chain = %CHAIN,
            transaction_hash = %receipt.transaction_hash,
            file_hash = %file_hash,
            "File anchored"
        );

        Ok(ChainReceipt {
            file_hash: Some(file_hash),
            ..receipt
        })
    }

    async fn get_user_files(&self, uploader: &str) -> Result<Vec<ChainFileInfo>, ChainError> {
        self.contract.get_user_files(uploader).await
    }

    async fn get_file(&self, uploader: &str, file_hash: &str) -> Result<ChainFileDetail, ChainError> {
        self.contract.get_file(uploader, file_hash).await
    }

    async fn delete_files(
        &self,
        uploader: &str,
        file_hashes: &[String],
    ) -> Result<ChainReceipt, ChainError> {
        let outcome = self.contract.delete_files(uploader, file_hashes).await?;
        self.confirm("deleteFiles", outcome).await
    }

    async fn share_files(
        &self,
        uploader: &str,
        file_hashes: &[String],
        expire_minutes: u32,
    ) -> Result<ChainReceipt, ChainError> {
        let (outcome, share_code) = self
            .contract
            .share_files(uploader, file_hashes, expire_minutes)
            .await?;
        let receipt = self.confirm("shareFiles", outcome).await?;

        Ok(ChainReceipt {
            share_code: Some(share_code),
            ..receipt
        })
    }

    async fn get_shared_files(&self, share_code: &str) -> Result<ChainShareInfo, ChainError> {
        self.contract.get_shared_files(share_code).await
    }

    async fn cancel_share(&self, share_code: &str) -> Result<ChainReceipt, ChainError> {
        let outcome = self.contract.cancel_share(share_code).await?;
        self.confirm("cancelShare", outcome).await
    }

    async fn get_user_share_codes(&self, uploader: &str) -> Result<Vec<String>, ChainError> {
        self.contract.get_user_share_codes(uploader).await
    }

    async fn get_share_info(&self, share_code: &str) -> Result<ChainShareInfo, ChainError> {
        self.contract.get_share_info(share_code).await
    }

    async fn get_chain_status(&self) -> ChainStatus {
        match self.fetch_status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(chain = %CHAIN, error = %e, "Ledger status query failed");
                ChainStatus::unhealthy(CHAIN)
            }
        }
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<ChainTransaction, ChainError> {
        const OP: &str = "getTransaction";
        require_non_empty(CHAIN, OP, "transaction hash", tx_hash)?;

        let hash = format!("0x{}", normalize_hash(tx_hash));
        let transaction = self
            .rpc
            .call(OP, "eth_getTransactionByHash", vec![json!(hash)])
            .await?;
        if transaction.is_null() {
            return Err(ChainError::not_found(CHAIN, OP, format!("transaction {}", hash)));
        }

        let receipt = self
            .rpc
            .call(OP, "eth_getTransactionReceipt", vec![json!(hash)])
            .await?;

        Ok(eth_transaction_from_json(&transaction, &receipt, &hash))
    }
}

/// Ethereum receipts report success as status `0x1`
pub(crate) fn eth_transaction_from_json(transaction: &Value, receipt: &Value, hash: &str) -> ChainTransaction {
    let field = |name: &str| transaction.get(name).and_then(value_str);

    ChainTransaction {
        hash: field("hash").unwrap_or_else(|| hash.to_string()),
        chain_id: transaction
            .get("chainId")
            .and_then(value_u64)
            .map(|id| id.to_string()),
        group_id: None,
        from: field("from"),
        to: field("to"),
        input: field("input"),
        block_number: transaction.get("blockNumber").and_then(value_u64),
        gas_used: receipt.get("gasUsed").and_then(value_u64),
        success: receipt.get("status").and_then(value_u64) == Some(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rpc_url: Option<&str>) -> ChainConfig {
        ChainConfig {
            backend: CHAIN,
            gateway_url: "http://127.0.0.1:1".to_string(),
            rpc_url: rpc_url.map(str::to_string),
            timeout_secs: 2,
            ..crate::config::Config::default().chain
        }
    }

    #[test]
    fn test_rpc_url_is_required() {
        let err = BesuAdapter::new(&config(None)).err().unwrap();
        assert_eq!(err.kind(), crate::chain::ChainErrorKind::InvalidInput);
        assert!(BesuAdapter::new(&config(Some("http://127.0.0.1:1"))).is_ok());
    }

    #[test]
    fn test_eth_transaction_from_json() {
        let tx = json!({
            "hash": "0xfeed",
            "chainId": "0x7e5",
            "from": "0xaa",
            "to": "0xbb",
            "input": "0x",
            "blockNumber": "0x20"
        });

        let mined = eth_transaction_from_json(&tx, &json!({"status": "0x1", "gasUsed": "0x5208"}), "0xfeed");
        assert_eq!(mined.chain_id.as_deref(), Some("2021"));
        assert_eq!(mined.block_number, Some(32));
        assert_eq!(mined.gas_used, Some(21000));
        assert!(mined.success);

        let reverted = eth_transaction_from_json(&tx, &json!({"status": "0x0"}), "0xfeed");
        assert!(!reverted.success);

        let pending = eth_transaction_from_json(&tx, &Value::Null, "0xfeed");
        assert!(!pending.success);
    }

    #[tokio::test]
    async fn test_unreachable_rpc_is_unhealthy() {
        let adapter = BesuAdapter::new(&config(Some("http://127.0.0.1:1"))).unwrap();
        let status = adapter.get_chain_status().await;
        assert!(!status.healthy);
        assert!(!adapter.is_healthy().await);

        let err = adapter.get_transaction("0xfeed").await.unwrap_err();
        assert!(err.kind().is_transient());
    }
}
