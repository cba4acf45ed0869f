//! Ledger anchoring
//!
//! Provides:
//! - A uniform adapter over FISCO BCOS (self-hosted or BSN) and BSN Besu
//! - An in-process ledger for development and tests
//! - Typed errors that separate transient transport failures from rejections

mod adapter;
mod backend;
mod besu;
mod contract;
mod error;
mod fisco;
mod gateway;
mod memory;
mod types;

pub use adapter::{ChainAdapter, MAX_SHARE_EXPIRE_MINUTES};
pub use backend::ChainBackend;
pub use besu::{BesuAdapter, JsonRpcClient};
pub use contract::SharingContract;
pub use error::{ChainError, ChainErrorKind};
pub use fisco::FiscoAdapter;
pub use gateway::{ContractGateway, TransactionOutcome, BSN_APP_KEY_HEADER};
pub use memory::InMemoryLedger;
pub use types::*;
