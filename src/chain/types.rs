//! Ledger-facing value objects

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledger backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    /// Self-hosted FISCO BCOS node
    LocalFisco,
    /// FISCO BCOS on the BSN managed network
    BsnFisco,
    /// Hyperledger Besu on the BSN managed network
    BsnBesu,
    /// In-process ledger
    Memory,
}

impl ChainType {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::LocalFisco => "Local FISCO",
            Self::BsnFisco => "BSN FISCO",
            Self::BsnBesu => "BSN Besu",
            Self::Memory => "Memory Ledger",
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ChainType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "local_fisco" | "fisco" => Ok(Self::LocalFisco),
            "bsn_fisco" => Ok(Self::BsnFisco),
            "bsn_besu" | "besu" => Ok(Self::BsnBesu),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown chain backend: {}", other)),
        }
    }
}

/// Outcome of a ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReceipt {
    pub transaction_hash: String,
    /// Ledger record key for stored files
    pub file_hash: Option<String>,
    /// Issued by share operations
    pub share_code: Option<String>,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainFileInfo {
    pub file_name: String,
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainFileDetail {
    pub uploader: String,
    pub file_name: String,
    pub param: String,
    /// The anchored chunk manifest
    pub content: String,
    pub file_hash: String,
    /// Milliseconds since the epoch
    pub upload_timestamp: i64,
}

impl ChainFileDetail {
    pub fn uploaded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.upload_timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainShareInfo {
    pub share_code: String,
    pub uploader: String,
    pub file_hashes: Vec<String>,
    /// Milliseconds since the epoch
    pub expire_timestamp: i64,
    /// False once cancelled
    pub is_valid: bool,
}

impl ChainShareInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_timestamp <= now.timestamp_millis()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
    pub chain_type: ChainType,
    pub block_number: Option<u64>,
    pub transaction_count: Option<u64>,
    pub failed_transaction_count: Option<u64>,
    pub healthy: bool,
    pub last_update_time: DateTime<Utc>,
}

impl ChainStatus {
    pub fn unhealthy(chain_type: ChainType) -> Self {
        Self {
            chain_type,
            block_number: None,
            transaction_count: None,
            failed_transaction_count: None,
            healthy: false,
            last_update_time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTransaction {
    pub hash: String,
    pub chain_id: Option<String>,
    pub group_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub input: Option<String>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub success: bool,
}
