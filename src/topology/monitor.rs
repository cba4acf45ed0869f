//! Node health probe and metrics poller

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::placement::PlacementResolver;
use super::types::{NodeHealth, NodeMetrics, NodeTopologyChangeEvent, PhysicalNodeConfig};

const INFLIGHT_METRIC: &str = "minio_s3_requests_inflight_total";
const WAITING_METRIC: &str = "minio_s3_requests_waiting_total";
const FREE_BYTES_METRIC: &str = "minio_cluster_capacity_usable_free_bytes";
const TOTAL_BYTES_METRIC: &str = "minio_cluster_capacity_usable_total_bytes";

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Probe timed out")]
    Timeout,

    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Unexpected status: {0}")]
    Status(u16),
}

/// Outcome of a successful probe
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    /// Absent if the node is live but its metrics could not be scraped
    pub metrics: Option<NodeMetrics>,
}

/// Liveness and metrics source for a physical node
#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn probe(&self, node: &PhysicalNodeConfig) -> Result<ProbeReport, ProbeError>;
}

// ============================================================================
// HTTP Probe
// ============================================================================

/// Probes MinIO's health endpoint and scrapes its Prometheus metrics
pub struct HttpNodeProbe {
    client: reqwest::Client,
    health_path: String,
    metrics_path: String,
}

impl HttpNodeProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            health_path: "/minio/health/live".to_string(),
            metrics_path: "/minio/v2/metrics/cluster".to_string(),
        })
    }

    fn url(node: &PhysicalNodeConfig, path: &str) -> String {
        format!("{}{}", node.endpoint.trim_end_matches('/'), path)
    }

    async fn scrape(&self, node: &PhysicalNodeConfig) -> Option<NodeMetrics> {
        let response = self
            .client
            .get(Self::url(node, &self.metrics_path))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        parse_prometheus_metrics(&body)
    }
}

#[async_trait]
impl NodeProbe for HttpNodeProbe {
    async fn probe(&self, node: &PhysicalNodeConfig) -> Result<ProbeReport, ProbeError> {
        let response = self
            .client
            .get(Self::url(node, &self.health_path))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout
                } else {
                    ProbeError::Unreachable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status().as_u16()));
        }

        let metrics = self.scrape(node).await;
        if metrics.is_none() {
            tracing::debug!(node = %node.name, "Node is live but metrics are unavailable");
        }
        Ok(ProbeReport { metrics })
    }
}

/// Parse the Prometheus text exposition format.
///
/// Request gauges are summed across label sets; capacity gauges keep the
/// last sample. Returns `None` when none of the metrics are present.
pub fn parse_prometheus_metrics(text: &str) -> Option<NodeMetrics> {
    let mut inflight: Option<f64> = None;
    let mut waiting: Option<f64> = None;
    let mut free: Option<f64> = None;
    let mut total: Option<f64> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let name_end = line.find(|c: char| c == '{' || c.is_whitespace());
        let Some(name_end) = name_end else { continue };
        let name = &line[..name_end];

        let Some(value) = line
            .rsplit(|c: char| c.is_whitespace())
            .next()
            .and_then(|v| v.parse::<f64>().ok())
        else {
            continue;
        };

        match name {
            INFLIGHT_METRIC => *inflight.get_or_insert(0.0) += value,
            WAITING_METRIC => *waiting.get_or_insert(0.0) += value,
            FREE_BYTES_METRIC => free = Some(value),
            TOTAL_BYTES_METRIC => total = Some(value),
            _ => {}
        }
    }

    if inflight.is_none() && waiting.is_none() && free.is_none() && total.is_none() {
        return None;
    }

    Some(NodeMetrics {
        api_inflight_requests: inflight.unwrap_or(0.0).max(0.0) as u64,
        api_waiting_requests: waiting.unwrap_or(0.0).max(0.0) as u64,
        disk_usage_percent: NodeMetrics::disk_usage_from(free, total),
    })
}

// ============================================================================
// Poller
// ============================================================================

/// Periodically probes every configured node and feeds the results into the
/// resolver
pub struct MetricsPoller {
    resolver: Arc<PlacementResolver>,
    probe: Arc<dyn NodeProbe>,
    interval: Duration,
}

impl MetricsPoller {
    pub fn new(resolver: Arc<PlacementResolver>, probe: Arc<dyn NodeProbe>, interval: Duration) -> Self {
        Self {
            resolver,
            probe,
            interval,
        }
    }

    /// Run one polling cycle
    pub async fn poll_once(&self) {
        let topology = self.resolver.topology();
        let nodes: Vec<&PhysicalNodeConfig> = topology.nodes().collect();

        let results =
            futures::future::join_all(nodes.iter().map(|node| self.probe.probe(node))).await;

        let registry = self.resolver.registry();
        let mut metrics = HashMap::with_capacity(nodes.len());

        for (node, result) in nodes.iter().zip(results) {
            let current = registry.health(&node.name);
            match result {
                Ok(report) => {
                    if current != Some(NodeHealth::Online) {
                        self.resolver
                            .apply_topology_event(&NodeTopologyChangeEvent::online(&node.name));
                    }
                    if let Some(m) = report.metrics {
                        metrics.insert(node.name.clone(), m);
                    }
                }
                Err(e) => {
                    if current != Some(NodeHealth::Offline) {
                        tracing::warn!(node = %node.name, error = %e, "Node health check failed");
                        self.resolver
                            .apply_topology_event(&NodeTopologyChangeEvent::offline(&node.name));
                    }
                }
            }
        }

        tracing::debug!(
            nodes = nodes.len(),
            with_metrics = metrics.len(),
            "Polling cycle complete"
        );
        registry.replace_metrics(metrics);
    }

    /// Start the polling loop. The first cycle runs immediately.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                self.poll_once().await;
            }
        })
    }
}
