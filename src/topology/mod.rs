//! Node topology
//!
//! Provides:
//! - Static topology (physical nodes, logical pairs) as an immutable snapshot
//! - Per-node health and load metrics
//! - Load-aware placement with failover
//! - Health probing and metrics polling
//! - Topology file reloads

mod monitor;
mod placement;
mod registry;
mod reload;
mod types;

pub use monitor::*;
pub use placement::*;
pub use registry::*;
pub use reload::TopologyReloader;
pub use types::*;

#[cfg(test)]
pub(crate) use types::fixtures;
