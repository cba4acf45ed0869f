//! Secondary replica writes
//!
//! After the primary acknowledges a chunk, the copy to the other pair member
//! runs in the background with bounded retries. Copies that exhaust their
//! retries are recorded as degraded; a periodic repair pass copies them over
//! from the pair member that holds the object.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::topology::{NodeHealth, PlacementResolver};

use super::node_store::{put_with_timeout, NodeStore};

/// One replica copy to perform
#[derive(Debug, Clone)]
pub struct ReplicaJob {
    pub upload_id: String,
    pub part_number: u32,
    pub node: String,
    pub key: String,
    pub data: Arc<Vec<u8>>,
}

/// A replica that could not be written
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedWrite {
    pub upload_id: String,
    pub part_number: u32,
    pub node: String,
    pub key: String,
    pub attempts: u32,
    pub last_error: String,
    pub recorded_at: DateTime<Utc>,
}

/// Objects currently missing their secondary copy
#[derive(Default)]
pub struct DegradedWriteTracker {
    entries: RwLock<HashMap<(String, String), DegradedWrite>>,
}

impl DegradedWriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, write: DegradedWrite) {
        self.entries
            .write()
            .insert((write.node.clone(), write.key.clone()), write);
    }

    /// Forget an entry once the copy exists. Returns true if one was removed.
    pub fn clear(&self, node: &str, key: &str) -> bool {
        self.entries
            .write()
            .remove(&(node.to_string(), key.to_string()))
            .is_some()
    }

    pub fn contains(&self, node: &str, key: &str) -> bool {
        self.entries
            .read()
            .contains_key(&(node.to_string(), key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Every degraded write, oldest first
    pub fn entries(&self) -> Vec<DegradedWrite> {
        let mut writes: Vec<_> = self.entries.read().values().cloned().collect();
        writes.sort_by_key(|w| w.recorded_at);
        writes
    }

    /// Degraded writes for one node, oldest first
    pub fn for_node(&self, node: &str) -> Vec<DegradedWrite> {
        self.entries().into_iter().filter(|w| w.node == node).collect()
    }
}

/// Outcome of one repair pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub repaired: usize,
    /// The copy turned out to exist already
    pub present: usize,
    /// Target node not online; left for a later pass
    pub deferred: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicaPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub timeout: Duration,
}

impl Default for ReplicaPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Runs replica copies in background tasks
#[derive(Clone)]
pub struct ReplicaWriter {
    store: Arc<dyn NodeStore>,
    tracker: Arc<DegradedWriteTracker>,
    policy: ReplicaPolicy,
    in_flight: Arc<AtomicUsize>,
}

impl ReplicaWriter {
    pub fn new(store: Arc<dyn NodeStore>, tracker: Arc<DegradedWriteTracker>, policy: ReplicaPolicy) -> Self {
        Self {
            store,
            tracker,
            policy,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn tracker(&self) -> &Arc<DegradedWriteTracker> {
        &self.tracker
    }

    /// Replica copies not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start a replica copy. The handle resolves to whether the copy landed.
    pub fn schedule(&self, job: ReplicaJob) -> JoinHandle<bool> {
        let writer = self.clone();
        writer.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let stored = writer.run(&job).await;
            writer.in_flight.fetch_sub(1, Ordering::SeqCst);
            stored
        })
    }

    /// Copy every degraded object from a pair member that holds it
    pub async fn repair_once(&self, resolver: &PlacementResolver) -> RepairSummary {
        let topology = resolver.topology();
        let registry = resolver.registry();
        let mut summary = RepairSummary::default();

        for write in self.tracker.entries() {
            if registry.health(&write.node) != Some(NodeHealth::Online) {
                summary.deferred += 1;
                continue;
            }

            if let Ok(true) = self.store.part_exists(&write.node, &write.key).await {
                self.tracker.clear(&write.node, &write.key);
                summary.present += 1;
                continue;
            }

            let peers: Vec<&str> = topology
                .logical_nodes()
                .iter()
                .filter_map(|l| l.peer_of(&write.node))
                .collect();

            let mut source = None;
            for peer in peers {
                match self.store.get_part(peer, &write.key).await {
                    Ok(data) => {
                        source = Some((peer, data));
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(node = %peer, key = %write.key, error = %e, "Repair source unavailable");
                    }
                }
            }

            let Some((peer, data)) = source else {
                tracing::warn!(node = %write.node, key = %write.key, "No pair member holds the object");
                summary.failed += 1;
                continue;
            };

            match put_with_timeout(self.store.as_ref(), &write.node, &write.key, data, self.policy.timeout).await {
                Ok(_) => {
                    self.tracker.clear(&write.node, &write.key);
                    summary.repaired += 1;
                    tracing::info!(
                        upload_id = %write.upload_id,
                        part_number = write.part_number,
                        node = %write.node,
                        from = %peer,
                        "Degraded replica repaired"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(node = %write.node, key = %write.key, error = %e, "Replica repair failed");
                }
            }
        }

        summary
    }

    /// Run `repair_once` periodically
    pub fn start_repair_task(self, resolver: Arc<PlacementResolver>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if self.tracker.is_empty() {
                    continue;
                }
                let summary = self.repair_once(&resolver).await;
                tracing::info!(
                    repaired = summary.repaired,
                    present = summary.present,
                    deferred = summary.deferred,
                    failed = summary.failed,
                    "Replica repair pass complete"
                );
            }
        })
    }

    async fn run(&self, job: &ReplicaJob) -> bool {
        let attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match put_with_timeout(
                self.store.as_ref(),
                &job.node,
                &job.key,
                job.data.clone(),
                self.policy.timeout,
            )
            .await
            {
                Ok(_) => {
                    if self.tracker.clear(&job.node, &job.key) {
                        tracing::info!(node = %job.node, key = %job.key, "Degraded replica repaired");
                    }
                    tracing::debug!(
                        upload_id = %job.upload_id,
                        part_number = job.part_number,
                        node = %job.node,
                        attempt,
                        "Replica stored"
                    );
                    return true;
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        upload_id = %job.upload_id,
                        part_number = job.part_number,
                        node = %job.node,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Replica write failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }

        tracing::error!(
            upload_id = %job.upload_id,
            part_number = job.part_number,
            node = %job.node,
            "Replica write retries exhausted, recording degraded write"
        );
        self.tracker.record(DegradedWrite {
            upload_id: job.upload_id.clone(),
            part_number: job.part_number,
            node: job.node.clone(),
            key: job.key.clone(),
            attempts,
            last_error,
            recorded_at: Utc::now(),
        });
        false
    }
}
