//! Topology file reloads
//!
//! The topology document is re-read on an interval. A changed document is
//! applied to the node store first, so placement never routes to a node the
//! store cannot reach, then swapped into the resolver.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::ConfigError;
use crate::storage::NodeStore;

use super::placement::PlacementResolver;
use super::types::{TopologyConfig, TopologySnapshot};

pub struct TopologyReloader {
    path: PathBuf,
    resolver: Arc<PlacementResolver>,
    nodes: Arc<dyn NodeStore>,
    interval: Duration,
}

impl TopologyReloader {
    pub fn new(
        path: PathBuf,
        resolver: Arc<PlacementResolver>,
        nodes: Arc<dyn NodeStore>,
        interval: Duration,
    ) -> Self {
        Self {
            path,
            resolver,
            nodes,
            interval,
        }
    }

    /// Re-read the file and apply it if it differs from the current
    /// snapshot. Returns whether anything changed.
    pub fn reload_once(&self) -> Result<bool, ConfigError> {
        let snapshot = TopologySnapshot::from_config(TopologyConfig::load(&self.path)?)?;
        if snapshot == *self.resolver.topology() {
            return Ok(false);
        }

        self.nodes.sync_topology(&snapshot);
        self.resolver.replace_topology(snapshot);
        Ok(true)
    }

    /// Start the reload loop. A bad document is logged and the current
    /// topology kept.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; startup already loaded the file
            interval.tick().await;

            loop {
                interval.tick().await;
                match self.reload_once() {
                    Ok(true) => tracing::info!(path = %self.path.display(), "Topology reloaded"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Topology reload failed, keeping current topology"
                    ),
                }
            }
        })
    }
}
