//! Storage module for chunk objects on physical nodes
//!
//! Provides S3-compatible and in-memory node backends, object naming, and
//! background replica writes.

mod node_store;
mod replication;
mod s3_client;
mod types;

pub use node_store::*;
pub use replication::*;
pub use s3_client::S3Client;
pub use types::*;
