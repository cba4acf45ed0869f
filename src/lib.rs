//! Record Vault
//!
//! Chunked, replicated file storage over paired S3-compatible nodes, with
//! per-tenant quotas and ledger anchoring of completed files.
//!
//! # Modules
//!
//! - `topology`: Physical nodes, logical pairs, health and placement
//! - `storage`: Chunk objects on nodes and background replica writes
//! - `upload`: Upload sessions, part tracking and the chunk manifest
//! - `quota`: Usage accounting and quota decisions
//! - `chain`: Ledger adapters (FISCO BCOS, BSN Besu, in-memory)
//! - `orchestrator`: The end-to-end upload workflow

pub mod chain;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod quota;
pub mod storage;
pub mod topology;
pub mod upload;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{
    BeginUpload, ChunkAck, OrchestratorSettings, TenantContext, UploadOrchestrator, UploadReceipt,
};
