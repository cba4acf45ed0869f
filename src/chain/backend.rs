//! Configured ledger backend

use async_trait::async_trait;

use crate::config::ChainConfig;

use super::adapter::ChainAdapter;
use super::besu::BesuAdapter;
use super::error::ChainError;
use super::fisco::FiscoAdapter;
use super::memory::InMemoryLedger;
use super::types::{
    ChainFileDetail, ChainFileInfo, ChainReceipt, ChainShareInfo, ChainStatus, ChainTransaction,
    ChainType,
};

/// The single active ledger, chosen at startup by `CHAIN_BACKEND`
#[derive(Clone)]
pub enum ChainBackend {
    LocalFisco(FiscoAdapter),
    BsnFisco(FiscoAdapter),
    BsnBesu(BesuAdapter),
    Memory(InMemoryLedger),
}

impl ChainBackend {
    pub fn from_config(config: &ChainConfig) -> Result<Self, ChainError> {
        Ok(match config.backend {
            ChainType::LocalFisco => Self::LocalFisco(FiscoAdapter::new(ChainType::LocalFisco, config)?),
            ChainType::BsnFisco => Self::BsnFisco(FiscoAdapter::new(ChainType::BsnFisco, config)?),
            ChainType::BsnBesu => Self::BsnBesu(BesuAdapter::new(config)?),
            ChainType::Memory => Self::Memory(InMemoryLedger::new()),
        })
    }
}

macro_rules! dispatch {
    ($self:ident, $adapter:ident => $call:expr) => {
        match $self {
            ChainBackend::LocalFisco($adapter) | ChainBackend::BsnFisco($adapter) => $call,
            ChainBackend::BsnBesu($adapter) => $call,
            ChainBackend::Memory($adapter) => $call,
        }
    };
}

#[async_trait]
impl ChainAdapter for ChainBackend {
    fn chain_type(&self) -> ChainType {
        dispatch!(self, a => a.chain_type())
    }

    async fn store_file(
        &self,
        uploader: &str,
        file_name: &str,
        content: &str,
        param: &str,
    ) -> Result<ChainReceipt, ChainError> {
        dispatch!(self, a => a.store_file(uploader, file_name, content, param).await)
    }

    async fn get_user_files(&self, uploader: &str) -> Result<Vec<ChainFileInfo>, ChainError> {
        dispatch!(self, a => a.get_user_files(uploader).await)
    }

    async fn get_file(&self, uploader: &str, file_hash: &str) -> Result<ChainFileDetail, ChainError> {
        dispatch!(self, a => a.get_file(uploader, file_hash).await)
    }

    async fn delete_files(
        &self,
        uploader: &str,
        file_hashes: &[String],
    ) -> Result<ChainReceipt, ChainError> {
        dispatch!(self, a => a.delete_files(uploader, file_hashes).await)
    }

    async fn share_files(
        &self,
        uploader: &str,
        file_hashes: &[String],
        expire_minutes: u32,
    ) -> Result<ChainReceipt, ChainError> {
        dispatch!(self, a => a.share_files(uploader, file_hashes, expire_minutes).await)
    }

    async fn get_shared_files(&self, share_code: &str) -> Result<ChainShareInfo, ChainError> {
        dispatch!(self, a => a.get_shared_files(share_code).await)
    }

    async fn cancel_share(&self, share_code: &str) -> Result<ChainReceipt, ChainError> {
        dispatch!(self, a => a.cancel_share(share_code).await)
    }

    async fn get_user_share_codes(&self, uploader: &str) -> Result<Vec<String>, ChainError> {
        dispatch!(self, a => a.get_user_share_codes(uploader).await)
    }

    async fn get_share_info(&self, share_code: &str) -> Result<ChainShareInfo, ChainError> {
        dispatch!(self, a => a.get_share_info(share_code).await)
    }

    async fn get_chain_status(&self) -> ChainStatus {
        dispatch!(self, a => a.get_chain_status().await)
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<ChainTransaction, ChainError> {
        dispatch!(self, a => a.get_transaction(tx_hash).await)
    }

    async fn is_healthy(&self) -> bool {
        dispatch!(self, a => a.is_healthy().await)
    }
}
