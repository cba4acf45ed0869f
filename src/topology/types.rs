//! Node topology types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::config::{load_json, ConfigError};

// ============================================================================
// Static Configuration
// ============================================================================

/// A physical storage node as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalNodeConfig {
    /// Node name, also the bucket that holds this node's parts
    pub name: String,

    /// S3-compatible endpoint URL
    pub endpoint: String,

    pub access_key: String,

    pub secret_key: String,

    #[serde(default)]
    pub region: Option<String>,

    /// Independent failure boundary (host, rack, zone)
    #[serde(default)]
    pub fault_domain: Option<String>,
}

/// A logical node as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalNodeConfig {
    pub name: String,

    /// Primary then secondary
    pub physical_node_pair: Vec<String>,
}

/// Topology document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyConfig {
    #[serde(default)]
    pub nodes: Vec<PhysicalNodeConfig>,

    #[serde(default)]
    pub logical_nodes: Vec<LogicalNodeConfig>,
}

impl TopologyConfig {
    /// Load and validate a topology document from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: TopologyConfig = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Every logical node must reference two distinct configured nodes
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(ConfigError::InvalidTopology("node with empty name".to_string()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::InvalidTopology(format!(
                    "duplicate node name: {}",
                    node.name
                )));
            }
        }

        let mut logical_names = HashSet::new();
        for logical in &self.logical_nodes {
            if !logical_names.insert(logical.name.as_str()) {
                return Err(ConfigError::InvalidTopology(format!(
                    "duplicate logical node: {}",
                    logical.name
                )));
            }
            match logical.physical_node_pair.as_slice() {
                [primary, secondary] if primary != secondary => {
                    for member in [primary, secondary] {
                        if !names.contains(member.as_str()) {
                            return Err(ConfigError::InvalidTopology(format!(
                                "logical node {} references unknown node {}",
                                logical.name, member
                            )));
                        }
                    }
                }
                _ => {
                    return Err(ConfigError::InvalidTopology(format!(
                        "logical node {} must map to exactly two distinct nodes",
                        logical.name
                    )));
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// Topology Snapshot
// ============================================================================

/// A routing target backed by a redundant pair of physical nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalNode {
    pub name: String,
    pub primary: String,
    pub secondary: String,
}

impl LogicalNode {
    /// Pair members in configured order
    pub fn members(&self) -> [&str; 2] {
        [&self.primary, &self.secondary]
    }

    /// The other member of the pair
    pub fn peer_of(&self, node: &str) -> Option<&str> {
        if node == self.primary {
            Some(&self.secondary)
        } else if node == self.secondary {
            Some(&self.primary)
        } else {
            None
        }
    }
}

/// Immutable view of the configured topology.
///
/// Never mutated after construction; a reload builds a new snapshot and swaps
/// it in whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologySnapshot {
    nodes: HashMap<String, PhysicalNodeConfig>,
    node_order: Vec<String>,
    logical_nodes: Vec<LogicalNode>,
}

impl TopologySnapshot {
    pub fn from_config(config: TopologyConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let logical_nodes = config
            .logical_nodes
            .into_iter()
            .filter_map(|l| {
                let mut pair = l.physical_node_pair.into_iter();
                Some(LogicalNode {
                    name: l.name,
                    primary: pair.next()?,
                    secondary: pair.next()?,
                })
            })
            .collect();

        let node_order = config.nodes.iter().map(|n| n.name.clone()).collect();
        let nodes = config
            .nodes
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect();

        Ok(Self {
            nodes,
            node_order,
            logical_nodes,
        })
    }

    pub fn node(&self, name: &str) -> Option<&PhysicalNodeConfig> {
        self.nodes.get(name)
    }

    /// Physical nodes in configured order
    pub fn nodes(&self) -> impl Iterator<Item = &PhysicalNodeConfig> {
        self.node_order.iter().filter_map(|n| self.nodes.get(n))
    }

    pub fn logical_node(&self, name: &str) -> Option<&LogicalNode> {
        self.logical_nodes.iter().find(|l| l.name == name)
    }

    pub fn logical_nodes(&self) -> &[LogicalNode] {
        &self.logical_nodes
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }
}

// ============================================================================
// Runtime State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeHealth {
    Online,
    Offline,
}

/// Load metrics for one node, refreshed every polling cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub api_inflight_requests: u64,
    pub api_waiting_requests: u64,
    pub disk_usage_percent: Option<f64>,
}

impl NodeMetrics {
    /// `(1 - free/total) * 100` clamped to [0, 100]
    pub fn disk_usage_from(free_bytes: Option<f64>, total_bytes: Option<f64>) -> Option<f64> {
        let (free, total) = (free_bytes?, total_bytes?);
        if total <= 0.0 || free < 0.0 {
            return None;
        }
        Some(((1.0 - free / total) * 100.0).clamp(0.0, 100.0))
    }
}

/// Point-in-time view of a physical node used by placement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub name: String,
    pub health: NodeHealth,
    /// Excluded from all pairs until re-added
    pub removed: bool,
    pub fault_domain: Option<String>,
    pub metrics: Option<NodeMetrics>,
}

impl NodeView {
    /// Accepts new writes
    pub fn is_writable(&self) -> bool {
        self.health == NodeHealth::Online && !self.removed
    }
}

// ============================================================================
// Topology Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopologyChangeType {
    NodeOnline,
    NodeOffline,
    NodeAdded,
    NodeRemoved,
    NodeDomainChanged,
}

/// Notification of a node or fault-domain state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTopologyChangeEvent {
    pub node_name: String,
    pub change_type: TopologyChangeType,
    #[serde(default)]
    pub fault_domain: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NodeTopologyChangeEvent {
    pub fn new(node_name: impl Into<String>, change_type: TopologyChangeType) -> Self {
        Self {
            node_name: node_name.into(),
            change_type,
            fault_domain: None,
            timestamp: Utc::now(),
        }
    }

    pub fn online(node_name: impl Into<String>) -> Self {
        Self::new(node_name, TopologyChangeType::NodeOnline)
    }

    pub fn offline(node_name: impl Into<String>) -> Self {
        Self::new(node_name, TopologyChangeType::NodeOffline)
    }

    pub fn with_fault_domain(mut self, domain: impl Into<String>) -> Self {
        self.fault_domain = Some(domain.into());
        self
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_rejects_single_member_pair() {
        let mut config = test_topology();
        config.logical_nodes[0].physical_node_pair = vec!["node-a".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_member() {
        let mut config = test_topology();
        config.logical_nodes[0].physical_node_pair =
            vec!["node-a".to_string(), "node-a".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_member() {
        let mut config = test_topology();
        config.logical_nodes[1].physical_node_pair =
            vec!["node-c".to_string(), "node-z".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = TopologySnapshot::from_config(test_topology()).unwrap();
        let logical = snapshot.logical_node("logic-1").unwrap();
        assert_eq!(logical.members(), ["node-a", "node-b"]);
        assert_eq!(logical.peer_of("node-b"), Some("node-a"));
        assert_eq!(logical.peer_of("node-c"), None);

        let order: Vec<_> = snapshot.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(order, ["node-a", "node-b", "node-c", "node-d"]);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "nodes": [
                    {{ "name": "n1", "endpoint": "http://n1:9000", "accessKey": "a", "secretKey": "s", "faultDomain": "z1" }},
                    {{ "name": "n2", "endpoint": "http://n2:9000", "accessKey": "a", "secretKey": "s" }}
                ],
                "logicalNodes": [ {{ "name": "l1", "physicalNodePair": ["n1", "n2"] }} ]
            }}"#
        )
        .unwrap();

        let config = TopologyConfig::load(file.path()).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].fault_domain.as_deref(), Some("z1"));
        assert_eq!(config.nodes[1].fault_domain, None);
    }

    #[test]
    fn test_disk_usage() {
        assert_eq!(NodeMetrics::disk_usage_from(Some(25.0), Some(100.0)), Some(75.0));
        assert_eq!(NodeMetrics::disk_usage_from(Some(0.0), Some(100.0)), Some(100.0));
        assert_eq!(NodeMetrics::disk_usage_from(Some(150.0), Some(100.0)), Some(0.0));
        assert_eq!(NodeMetrics::disk_usage_from(None, Some(100.0)), None);
        assert_eq!(NodeMetrics::disk_usage_from(Some(1.0), Some(0.0)), None);
    }
}
