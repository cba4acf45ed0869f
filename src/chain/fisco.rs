//! FISCO BCOS adapter
//!
//! Serves both the self-hosted node and the BSN-managed network. The two only
//! differ in gateway address and the BSN app key.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::config::ChainConfig;

use super::adapter::{require_non_empty, ChainAdapter};
use super::contract::SharingContract;
use super::error::ChainError;
use super::gateway::{value_str, value_u64, ContractGateway, TransactionOutcome};
use super::types::{
    ChainFileDetail, ChainFileInfo, ChainReceipt, ChainShareInfo, ChainStatus, ChainTransaction,
    ChainType,
};

#[derive(Clone)]
pub struct FiscoAdapter {
    contract: SharingContract,
}

impl FiscoAdapter {
    /// `chain_type` is either [`ChainType::LocalFisco`] or [`ChainType::BsnFisco`]
    pub fn new(chain_type: ChainType, config: &ChainConfig) -> Result<Self, ChainError> {
        if chain_type == ChainType::BsnFisco && config.app_key.is_none() {
            tracing::warn!(chain = %chain_type, "No BSN app key configured, gateway calls may be refused");
        }

        let gateway = ContractGateway::new(chain_type, config)?;
        tracing::info!(
            chain = %chain_type,
            gateway = %gateway.base_url(),
            contract = %config.contract_name,
            "Ledger adapter configured"
        );

        Ok(Self {
            contract: SharingContract::new(gateway),
        })
    }

    fn gateway(&self) -> &ContractGateway {
        self.contract.gateway()
    }

    async fn fetch_status(&self) -> Result<ChainStatus, ChainError> {
        let totals = self
            .gateway()
            .web3("getChainStatus", "transaction-total")
            .await?;

        Ok(ChainStatus {
            chain_type: self.chain_type(),
            block_number: totals.get("blockNumber").and_then(value_u64),
            transaction_count: totals.get("txSum").and_then(value_u64),
            failed_transaction_count: totals.get("failedTxSum").and_then(value_u64),
            healthy: true,
            last_update_time: Utc::now(),
        })
    }
}

fn receipt(outcome: TransactionOutcome) -> ChainReceipt {
    ChainReceipt {
        transaction_hash: outcome.transaction_hash,
        file_hash: None,
        share_code: None,
        block_number: outcome.block_number,
    }
}

#[async_trait]
impl ChainAdapter for FiscoAdapter {
    fn chain_type(&self) -> ChainType {
        self.gateway().chain_type()
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

        tracing::info!(
            chain = %self.chain_type(),
            transaction_hash = %outcome.transaction_hash,
            file_hash = %file_hash,
            "File anchored"
        );

        Ok(ChainReceipt {
            file_hash: Some(file_hash),
            ..receipt(outcome)
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
        self.contract.delete_files(uploader, file_hashes).await.map(receipt)
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

        Ok(ChainReceipt {
            share_code: Some(share_code),
            ..receipt(outcome)
        })
    }

    async fn get_shared_files(&self, share_code: &str) -> Result<ChainShareInfo, ChainError> {
        self.contract.get_shared_files(share_code).await
    }

    async fn cancel_share(&self, share_code: &str) -> Result<ChainReceipt, ChainError> {
        self.contract.cancel_share(share_code).await.map(receipt)
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
                tracing::warn!(chain = %self.chain_type(), error = %e, "Ledger status query failed");
                ChainStatus::unhealthy(self.chain_type())
            }
        }
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<ChainTransaction, ChainError> {
        const OP: &str = "getTransaction";
        require_non_empty(self.chain_type(), OP, "transaction hash", tx_hash)?;

        let hash = format!("0x{}", crate::upload::normalize_hash(tx_hash));
        let transaction = self
            .gateway()
            .web3(OP, &format!("transaction/{}", hash))
            .await?;
        if transaction.is_null() {
            return Err(ChainError::not_found(self.chain_type(), OP, format!("transaction {}", hash)));
        }

        let receipt = self
            .gateway()
            .web3(OP, &format!("transReceipt/{}", hash))
            .await?;

        Ok(transaction_from_json(&transaction, &receipt, &hash))
    }
}

/// Merge a transaction object and its receipt
pub(crate) fn transaction_from_json(transaction: &Value, receipt: &Value, hash: &str) -> ChainTransaction {
    let field = |name: &str| transaction.get(name).and_then(value_str);
    let success = !receipt.is_null()
        && receipt
            .get("status")
            .and_then(value_u64)
            .map_or(true, |status| status == 0);

    ChainTransaction {
        hash: field("hash").unwrap_or_else(|| hash.to_string()),
        chain_id: field("chainID").or_else(|| field("chainId")),
        group_id: field("groupID").or_else(|| field("groupId")),
        from: field("from"),
        to: field("to"),
        input: field("input"),
        block_number: receipt
            .get("blockNumber")
            .or_else(|| transaction.get("blockNumber"))
            .and_then(value_u64),
        gas_used: receipt.get("gasUsed").and_then(value_u64),
        success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unreachable_config() -> ChainConfig {
        ChainConfig {
            gateway_url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 2,
            ..crate::config::Config::default().chain
        }
    }

    #[test]
    fn test_transaction_from_json() {
        let tx = json!({
            "hash": "0xabc",
            "chainID": "chain0",
            "groupID": "group0",
            "from": "0x01",
            "to": "0x02",
            "input": "0x00"
        });
        let receipt = json!({"status": 0, "blockNumber": "0x5", "gasUsed": "21000"});

        let parsed = transaction_from_json(&tx, &receipt, "0xabc");
        assert_eq!(parsed.chain_id.as_deref(), Some("chain0"));
        assert_eq!(parsed.block_number, Some(5));
        assert_eq!(parsed.gas_used, Some(21000));
        assert!(parsed.success);

        let pending = transaction_from_json(&tx, &Value::Null, "0xabc");
        assert!(!pending.success);

        let reverted = transaction_from_json(&tx, &json!({"status": "0x16"}), "0xabc");
        assert!(!reverted.success);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_unhealthy() {
        let adapter = FiscoAdapter::new(ChainType::LocalFisco, &unreachable_config()).unwrap();

        let status = adapter.get_chain_status().await;
        assert!(!status.healthy);
        assert_eq!(status.chain_type, ChainType::LocalFisco);
        assert!(!adapter.is_healthy().await);

        let err = adapter
            .store_file("alice", "a.txt", "{}", "{}")
            .await
            .unwrap_err();
        assert!(err.kind().is_transient());
        assert_eq!(err.chain(), ChainType::LocalFisco);
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_any_call() {
        let adapter = FiscoAdapter::new(ChainType::BsnFisco, &unreachable_config()).unwrap();

        let err = adapter.share_files("alice", &["aa".to_string()], 0).await.unwrap_err();
        assert_eq!(err.kind(), crate::chain::ChainErrorKind::InvalidInput);

        let err = adapter.delete_files("alice", &[]).await.unwrap_err();
        assert_eq!(err.kind(), crate::chain::ChainErrorKind::InvalidInput);
    }
}
