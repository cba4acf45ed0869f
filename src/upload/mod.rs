//! Chunked upload tracking
//!
//! Provides:
//! - Upload session lifecycle (begin, record parts, finalize, abort)
//! - Part hashing and the file hash derived from part hashes
//! - The chunk manifest anchored for completed files

mod manifest;
mod session;
mod types;

pub use manifest::*;
pub use session::*;
pub use types::*;
