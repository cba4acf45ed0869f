//! Storage quotas
//!
//! Provides:
//! - Per-user and per-tenant limits with tenant overrides
//! - Usage counters (in-memory or SQLite)
//! - Quota decisions with shadow and enforce modes

mod engine;
mod types;
mod usage;

pub use engine::*;
pub use types::*;
pub use usage::*;
