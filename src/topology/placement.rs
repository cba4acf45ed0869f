//! Placement Resolver
//!
//! Maps logical nodes onto their physical pair and picks where a write (or
//! read) should go given current health and load.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::upload::LogicalNodeDirectory;

use super::registry::NodeHealthRegistry;
use super::types::{NodeMetrics, NodeTopologyChangeEvent, NodeView, TopologySnapshot};

// ============================================================================
// Load Score
// ============================================================================

/// Weights for the composite load score. Lower scores win.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadWeights {
    pub inflight: f64,
    pub waiting: f64,
    pub disk: f64,
    /// Request count at which the inflight term reaches ~76% of its weight
    pub inflight_scale: f64,
    pub waiting_scale: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            inflight: 1.0 / 3.0,
            waiting: 1.0 / 3.0,
            disk: 1.0 / 3.0,
            inflight_scale: 50.0,
            waiting_scale: 20.0,
        }
    }
}

impl LoadWeights {
    /// Composite score for a node. Nodes without metrics score 0.
    pub fn score(&self, metrics: Option<&NodeMetrics>) -> f64 {
        let Some(m) = metrics else {
            return 0.0;
        };

        let inflight = (m.api_inflight_requests as f64 / self.inflight_scale.max(1.0)).tanh();
        let waiting = (m.api_waiting_requests as f64 / self.waiting_scale.max(1.0)).tanh();
        let disk = (m.disk_usage_percent.unwrap_or(0.0) / 100.0).clamp(0.0, 1.0);

        self.inflight * inflight + self.waiting * waiting + self.disk * disk
    }
}

// ============================================================================
// Placement
// ============================================================================

/// Where a chunk write should land
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTarget {
    pub logic_node: String,
    /// Node that receives the synchronous write
    pub primary: String,
    /// Pair member scheduled for the asynchronous replica, if still in the pair
    pub secondary: Option<String>,
    /// Replicas sit in different fault domains
    pub cross_domain: bool,
}

impl WriteTarget {
    /// Replica destination once `written` has acknowledged the chunk
    pub fn replica_for(&self, written: &str) -> Option<&str> {
        if written == self.primary {
            self.secondary.as_deref()
        } else if Some(written) == self.secondary.as_deref() {
            Some(&self.primary)
        } else {
            None
        }
    }
}

pub struct PlacementResolver {
    topology: RwLock<Arc<TopologySnapshot>>,
    registry: Arc<NodeHealthRegistry>,
    weights: LoadWeights,
}

impl PlacementResolver {
    pub fn new(
        topology: TopologySnapshot,
        registry: Arc<NodeHealthRegistry>,
        weights: LoadWeights,
    ) -> Self {
        registry.sync_with(&topology);
        Self {
            topology: RwLock::new(Arc::new(topology)),
            registry,
            weights,
        }
    }

    /// Resolver with a fresh registry seeded from the snapshot
    pub fn from_snapshot(topology: TopologySnapshot, weights: LoadWeights) -> Self {
        Self::new(topology, Arc::new(NodeHealthRegistry::new()), weights)
    }

    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.topology.read().clone()
    }

    pub fn registry(&self) -> &Arc<NodeHealthRegistry> {
        &self.registry
    }

    pub fn weights(&self) -> &LoadWeights {
        &self.weights
    }

    /// Swap in a new topology. Readers holding the old snapshot keep it.
    pub fn replace_topology(&self, topology: TopologySnapshot) {
        self.registry.sync_with(&topology);
        let nodes = topology.nodes().count();
        let logical = topology.logical_nodes().len();
        *self.topology.write() = Arc::new(topology);
        tracing::info!(nodes, logical_nodes = logical, "Topology replaced");
    }

    /// Apply a node state transition reported by the poller or an operator
    pub fn apply_topology_event(&self, event: &NodeTopologyChangeEvent) {
        if self.registry.apply_event(event) {
            tracing::info!(
                node = %event.node_name,
                change = ?event.change_type,
                fault_domain = ?event.fault_domain,
                "Applied topology change"
            );
        }
    }

    fn member_views(&self, topology: &TopologySnapshot, logic_node: &str) -> Result<Vec<NodeView>> {
        let logical = topology.logical_node(logic_node).ok_or_else(|| {
            Error::InvalidRequest(format!("Unknown logical node: {}", logic_node))
        })?;
        let metrics = self.registry.metrics_snapshot();
        Ok(logical
            .members()
            .iter()
            .filter_map(|m| self.registry.view_with(m, &metrics))
            .collect())
    }

    /// Lowest-scored writable view; earlier pair members win ties
    fn best_of<'a>(&self, views: impl Iterator<Item = &'a NodeView>) -> Option<&'a NodeView> {
        let mut best: Option<(&NodeView, f64)> = None;
        for view in views {
            let score = self.weights.score(view.metrics.as_ref());
            match best {
                Some((_, best_score)) if score >= best_score => {}
                _ => best = Some((view, score)),
            }
        }
        best.map(|(v, _)| v)
    }

    /// Pick the physical node that should take the next chunk write
    pub fn resolve_write_target(&self, logic_node: &str) -> Result<WriteTarget> {
        let topology = self.topology();
        let views = self.member_views(&topology, logic_node)?;

        let primary = self
            .best_of(views.iter().filter(|v| v.is_writable()))
            .ok_or_else(|| Error::NoHealthyNode(logic_node.to_string()))?;

        let secondary = views
            .iter()
            .find(|v| v.name != primary.name && !v.removed);

        let cross_domain = match (&primary.fault_domain, secondary.map(|s| &s.fault_domain)) {
            (Some(a), Some(Some(b))) => a != b,
            _ => false,
        };
        if secondary.is_some() && !cross_domain {
            tracing::debug!(
                logic_node = %logic_node,
                "Replica pair shares a fault domain"
            );
        }

        let target = WriteTarget {
            logic_node: logic_node.to_string(),
            primary: primary.name.clone(),
            secondary: secondary.map(|s| s.name.clone()),
            cross_domain,
        };

        tracing::debug!(
            logic_node = %logic_node,
            primary = %target.primary,
            secondary = ?target.secondary,
            "Resolved write target"
        );

        Ok(target)
    }

    /// Pick the pair member to read from
    pub fn resolve_read_target(&self, logic_node: &str) -> Result<String> {
        let topology = self.topology();
        let views = self.member_views(&topology, logic_node)?;
        self.best_of(views.iter().filter(|v| v.is_writable()))
            .map(|v| v.name.clone())
            .ok_or_else(|| Error::NoHealthyNode(logic_node.to_string()))
    }

    /// Choose a logical node for a new upload.
    ///
    /// Only pairs with both members writable are candidates; the lowest
    /// average member score wins. Degraded pairs still take writes for
    /// sessions already placed on them.
    pub fn select_logical_node(&self) -> Result<String> {
        let topology = self.topology();
        let metrics = self.registry.metrics_snapshot();

        let mut best: Option<(&str, f64)> = None;
        for logical in topology.logical_nodes() {
            let writable: Vec<NodeView> = logical
                .members()
                .iter()
                .filter_map(|m| self.registry.view_with(m, &metrics))
                .filter(|v| v.is_writable())
                .collect();
            if writable.len() < 2 {
                continue;
            }

            let average = writable
                .iter()
                .map(|v| self.weights.score(v.metrics.as_ref()))
                .sum::<f64>()
                / writable.len() as f64;

            if best.map_or(true, |(_, best_avg)| average < best_avg) {
                best = Some((&logical.name, average));
            }
        }

        best.map(|(name, _)| name.to_string())
            .ok_or_else(|| Error::NoHealthyNode("*".to_string()))
    }
}

impl LogicalNodeDirectory for PlacementResolver {
    fn has_logical_node(&self, name: &str) -> bool {
        self.topology().logical_node(name).is_some()
    }
}
