//! Node Health Registry
//!
//! Tracks up/down state per physical node and the latest load metrics.
//! Each node's state sits behind its own lock; the metrics map is replaced
//! wholesale once per polling cycle.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::types::{
    NodeHealth, NodeMetrics, NodeTopologyChangeEvent, NodeView, TopologyChangeType,
    TopologySnapshot,
};

#[derive(Debug, Clone)]
struct NodeState {
    health: NodeHealth,
    removed: bool,
    fault_domain: Option<String>,
    changed_at: DateTime<Utc>,
}

impl NodeState {
    fn new(fault_domain: Option<String>) -> Self {
        Self {
            health: NodeHealth::Online,
            removed: false,
            fault_domain,
            changed_at: Utc::now(),
        }
    }
}

/// Live health and metrics for every known physical node
#[derive(Default)]
pub struct NodeHealthRegistry {
    nodes: RwLock<HashMap<String, Arc<RwLock<NodeState>>>>,
    metrics: RwLock<Arc<HashMap<String, NodeMetrics>>>,
}

impl NodeHealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with every node in the snapshot, all ONLINE
    pub fn from_snapshot(snapshot: &TopologySnapshot) -> Self {
        let registry = Self::new();
        registry.sync_with(snapshot);
        registry
    }

    /// Register nodes new to the snapshot and forget nodes no longer in it
    pub fn sync_with(&self, snapshot: &TopologySnapshot) {
        let mut nodes = self.nodes.write();

        nodes.retain(|name, _| {
            let keep = snapshot.contains_node(name);
            if !keep {
                tracing::info!(node = %name, "Node no longer configured, dropping state");
            }
            keep
        });

        for node in snapshot.nodes() {
            match nodes.get(&node.name) {
                Some(state) => {
                    let mut state = state.write();
                    if node.fault_domain.is_some() && state.fault_domain != node.fault_domain {
                        state.fault_domain = node.fault_domain.clone();
                    }
                }
                None => {
                    nodes.insert(
                        node.name.clone(),
                        Arc::new(RwLock::new(NodeState::new(node.fault_domain.clone()))),
                    );
                }
            }
        }
    }

    fn entry(&self, name: &str) -> Option<Arc<RwLock<NodeState>>> {
        self.nodes.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.read().contains_key(name)
    }

    /// Apply a topology change. Returns false if nothing changed.
    pub fn apply_event(&self, event: &NodeTopologyChangeEvent) -> bool {
        let entry = match event.change_type {
            TopologyChangeType::NodeAdded => {
                let mut nodes = self.nodes.write();
                nodes
                    .entry(event.node_name.clone())
                    .or_insert_with(|| {
                        Arc::new(RwLock::new(NodeState::new(event.fault_domain.clone())))
                    })
                    .clone()
            }
            _ => match self.entry(&event.node_name) {
                Some(entry) => entry,
                None => {
                    tracing::warn!(
                        node = %event.node_name,
                        change = ?event.change_type,
                        "Topology event for unknown node ignored"
                    );
                    return false;
                }
            },
        };

        let changed = {
            let mut state = entry.write();
            let before = (state.health, state.removed, state.fault_domain.clone());

            match event.change_type {
                TopologyChangeType::NodeOnline => state.health = NodeHealth::Online,
                TopologyChangeType::NodeOffline => state.health = NodeHealth::Offline,
                TopologyChangeType::NodeAdded => {
                    state.removed = false;
                    state.health = NodeHealth::Online;
                    if event.fault_domain.is_some() {
                        state.fault_domain = event.fault_domain.clone();
                    }
                }
                TopologyChangeType::NodeRemoved => state.removed = true,
                TopologyChangeType::NodeDomainChanged => {
                    state.fault_domain = event.fault_domain.clone();
                }
            }

            let changed = before != (state.health, state.removed, state.fault_domain.clone());
            if changed {
                state.changed_at = event.timestamp;
            }
            changed
        };

        if event.change_type == TopologyChangeType::NodeOffline {
            self.drop_metrics(&event.node_name);
        }

        changed
    }

    pub fn health(&self, name: &str) -> Option<NodeHealth> {
        self.entry(name).map(|e| e.read().health)
    }

    pub fn fault_domain(&self, name: &str) -> Option<String> {
        self.entry(name).and_then(|e| e.read().fault_domain.clone())
    }

    /// Time of the last state transition
    pub fn changed_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entry(name).map(|e| e.read().changed_at)
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    /// Install a freshly collected metrics map
    pub fn replace_metrics(&self, metrics: HashMap<String, NodeMetrics>) {
        *self.metrics.write() = Arc::new(metrics);
    }

    /// Current metrics map
    pub fn metrics_snapshot(&self) -> Arc<HashMap<String, NodeMetrics>> {
        self.metrics.read().clone()
    }

    pub fn metrics(&self, name: &str) -> Option<NodeMetrics> {
        self.metrics.read().get(name).cloned()
    }

    fn drop_metrics(&self, name: &str) {
        let mut guard = self.metrics.write();
        if guard.contains_key(name) {
            let mut next = (**guard).clone();
            next.remove(name);
            *guard = Arc::new(next);
        }
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// View of one node against a metrics snapshot taken by the caller
    pub fn view_with(
        &self,
        name: &str,
        metrics: &HashMap<String, NodeMetrics>,
    ) -> Option<NodeView> {
        let entry = self.entry(name)?;
        let state = entry.read();
        Some(NodeView {
            name: name.to_string(),
            health: state.health,
            removed: state.removed,
            fault_domain: state.fault_domain.clone(),
            metrics: metrics.get(name).cloned(),
        })
    }

    pub fn view(&self, name: &str) -> Option<NodeView> {
        let metrics = self.metrics_snapshot();
        self.view_with(name, &metrics)
    }

    /// Views of every registered node, sorted by name
    pub fn views(&self) -> Vec<NodeView> {
        let metrics = self.metrics_snapshot();
        let mut names: Vec<String> = self.nodes.read().keys().cloned().collect();
        names.sort();
        names
            .iter()
            .filter_map(|n| self.view_with(n, &metrics))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::types::fixtures::test_topology;
    use crate::topology::types::TopologyConfig;

    fn registry() -> NodeHealthRegistry {
        let snapshot = TopologySnapshot::from_config(test_topology()).unwrap();
        NodeHealthRegistry::from_snapshot(&snapshot)
    }

    fn metrics(inflight: u64) -> NodeMetrics {
        NodeMetrics {
            api_inflight_requests: inflight,
            api_waiting_requests: 0,
            disk_usage_percent: Some(10.0),
        }
    }

    #[test]
    fn test_nodes_start_online() {
        let registry = registry();
        assert_eq!(registry.health("node-a"), Some(NodeHealth::Online));
        assert_eq!(registry.fault_domain("node-b").as_deref(), Some("rack-2"));
        assert_eq!(registry.health("node-z"), None);
    }

    #[test]
    fn test_offline_event_drops_metrics() {
        let registry = registry();
        registry.replace_metrics(HashMap::from([
            ("node-a".to_string(), metrics(5)),
            ("node-b".to_string(), metrics(7)),
        ]));

        assert!(registry.apply_event(&NodeTopologyChangeEvent::offline("node-a")));
        assert_eq!(registry.health("node-a"), Some(NodeHealth::Offline));
        assert!(registry.metrics("node-a").is_none());
        assert_eq!(registry.metrics("node-b"), Some(metrics(7)));

        // Repeating the event changes nothing
        assert!(!registry.apply_event(&NodeTopologyChangeEvent::offline("node-a")));

        assert!(registry.apply_event(&NodeTopologyChangeEvent::online("node-a")));
        assert_eq!(registry.health("node-a"), Some(NodeHealth::Online));
    }

    #[test]
    fn test_removed_and_readded() {
        let registry = registry();
        registry.apply_event(&NodeTopologyChangeEvent::new(
            "node-c",
            TopologyChangeType::NodeRemoved,
        ));
        assert!(registry.view("node-c").unwrap().removed);
        assert!(!registry.view("node-c").unwrap().is_writable());

        registry.apply_event(
            &NodeTopologyChangeEvent::new("node-c", TopologyChangeType::NodeAdded)
                .with_fault_domain("rack-3"),
        );
        let view = registry.view("node-c").unwrap();
        assert!(view.is_writable());
        assert_eq!(view.fault_domain.as_deref(), Some("rack-3"));
    }

    #[test]
    fn test_domain_change() {
        let registry = registry();
        let event = NodeTopologyChangeEvent::new("node-a", TopologyChangeType::NodeDomainChanged)
            .with_fault_domain("rack-9");
        assert!(registry.apply_event(&event));
        assert_eq!(registry.fault_domain("node-a").as_deref(), Some("rack-9"));
        assert_eq!(registry.health("node-a"), Some(NodeHealth::Online));
    }

    #[test]
    fn test_unknown_node_event_ignored() {
        let registry = registry();
        assert!(!registry.apply_event(&NodeTopologyChangeEvent::offline("node-z")));
        assert!(!registry.contains("node-z"));
    }

    #[test]
    fn test_sync_with_forgets_unconfigured_nodes() {
        let registry = registry();
        let mut config: TopologyConfig = test_topology();
        config.nodes.truncate(2);
        config.logical_nodes.truncate(1);
        registry.sync_with(&TopologySnapshot::from_config(config).unwrap());

        assert!(registry.contains("node-a"));
        assert!(!registry.contains("node-c"));
        assert_eq!(registry.views().len(), 2);
    }
}
