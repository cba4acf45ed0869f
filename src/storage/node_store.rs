//! Part storage on physical nodes
//!
//! Each chunk is an independent object in the bucket of the node that holds
//! it. Backends:
//! - S3: one client per physical node (MinIO)
//! - Memory: in-process maps, for tests and local development

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::topology::TopologySnapshot;

use super::s3_client::S3Client;
use super::types::{StorageError, StoredObject};

/// Storage backend for chunk objects
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Write one part object to a node, returning its ETag
    async fn put_part(&self, node: &str, key: &str, data: Arc<Vec<u8>>) -> Result<String, StorageError>;

    /// Read a part object back, `ObjectNotFound` if the node lacks it
    async fn get_part(&self, node: &str, key: &str) -> Result<Arc<Vec<u8>>, StorageError>;

    async fn part_exists(&self, node: &str, key: &str) -> Result<bool, StorageError>;

    /// Follow a topology reload. Stores without per-node state ignore it.
    fn sync_topology(&self, _topology: &TopologySnapshot) {}
}

/// `put_part` bounded by a timeout
pub async fn put_with_timeout(
    store: &dyn NodeStore,
    node: &str,
    key: &str,
    data: Arc<Vec<u8>>,
    timeout: Duration,
) -> Result<StoredObject, StorageError> {
    let size = data.len() as u64;
    match tokio::time::timeout(timeout, store.put_part(node, key, data)).await {
        Ok(Ok(etag)) => Ok(StoredObject {
            node: node.to_string(),
            key: key.to_string(),
            etag,
            size,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(StorageError::Timeout {
            node: node.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

// ============================================================================
// S3 Backend
// ============================================================================

/// S3 clients keyed by node name
pub struct S3NodeStore {
    clients: RwLock<Arc<HashMap<String, S3Client>>>,
    /// Buckets already confirmed to exist
    known_buckets: Mutex<HashSet<String>>,
    create_buckets: bool,
}

impl S3NodeStore {
    pub fn new(topology: &TopologySnapshot, create_buckets: bool) -> Self {
        let store = Self {
            clients: RwLock::new(Arc::new(HashMap::new())),
            known_buckets: Mutex::new(HashSet::new()),
            create_buckets,
        };
        store.rebuild_clients(topology);
        store
    }

    /// Rebuild the client map for a new topology, reusing clients whose
    /// configuration did not change
    fn rebuild_clients(&self, topology: &TopologySnapshot) {
        let current = self.clients.read().clone();
        let mut next = HashMap::new();

        for node in topology.nodes() {
            let client = match current.get(&node.name) {
                Some(existing) if existing.node_config() == node => existing.clone(),
                Some(_) => {
                    tracing::info!(node = %node.name, "Node configuration changed, rebuilding client");
                    self.known_buckets.lock().remove(&node.name);
                    S3Client::new(node)
                }
                None => {
                    tracing::info!(node = %node.name, endpoint = %node.endpoint, "Registered storage node");
                    S3Client::new(node)
                }
            };
            next.insert(node.name.clone(), client);
        }

        for name in current.keys().filter(|n| !next.contains_key(*n)) {
            tracing::info!(node = %name, "Storage node removed from topology");
        }

        *self.clients.write() = Arc::new(next);
    }

    fn client(&self, node: &str) -> Result<S3Client, StorageError> {
        self.clients
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| StorageError::UnknownNode(node.to_string()))
    }

    async fn ensure_bucket(&self, client: &S3Client) -> Result<(), StorageError> {
        if !self.create_buckets || self.known_buckets.lock().contains(client.bucket()) {
            return Ok(());
        }
        client.ensure_bucket().await?;
        self.known_buckets.lock().insert(client.bucket().to_string());
        Ok(())
    }
}

#[async_trait]
impl NodeStore for S3NodeStore {
    async fn put_part(&self, node: &str, key: &str, data: Arc<Vec<u8>>) -> Result<String, StorageError> {
        let client = self.client(node)?;
        self.ensure_bucket(&client).await?;

        let data = Arc::try_unwrap(data).unwrap_or_else(|shared| (*shared).clone());
        client
            .put_object(key, data, "application/octet-stream")
            .await
    }

    async fn get_part(&self, node: &str, key: &str) -> Result<Arc<Vec<u8>>, StorageError> {
        self.client(node)?.get_object(key).await.map(Arc::new)
    }

    async fn part_exists(&self, node: &str, key: &str) -> Result<bool, StorageError> {
        self.client(node)?.object_exists(key).await
    }

    fn sync_topology(&self, topology: &TopologySnapshot) {
        self.rebuild_clients(topology);
    }
}

// ============================================================================
// Memory Backend
// ============================================================================

/// In-process node store with per-node failure injection
#[derive(Default)]
pub struct MemoryNodeStore {
    objects: RwLock<HashMap<(String, String), Arc<Vec<u8>>>>,
    failing: RwLock<HashSet<String>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to `node` fail (or succeed again)
    pub fn set_failing(&self, node: &str, failing: bool) {
        let mut set = self.failing.write();
        if failing {
            set.insert(node.to_string());
        } else {
            set.remove(node);
        }
    }

    pub fn get(&self, node: &str, key: &str) -> Option<Arc<Vec<u8>>> {
        self.objects
            .read()
            .get(&(node.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_count(&self, node: &str) -> usize {
        self.objects.read().keys().filter(|(n, _)| n == node).count()
    }

    /// Write attempts made against a node, successful or not
    pub fn attempts(&self, node: &str) -> usize {
        self.attempts.lock().get(node).copied().unwrap_or(0)
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn put_part(&self, node: &str, key: &str, data: Arc<Vec<u8>>) -> Result<String, StorageError> {
        *self.attempts.lock().entry(node.to_string()).or_default() += 1;

        if self.failing.read().contains(node) {
            return Err(StorageError::NodeUnavailable(node.to_string()));
        }

        let etag = hex::encode(&Sha256::digest(data.as_slice())[..16]);
        self.objects
            .write()
            .insert((node.to_string(), key.to_string()), data);
        Ok(etag)
    }

    async fn get_part(&self, node: &str, key: &str) -> Result<Arc<Vec<u8>>, StorageError> {
        if self.failing.read().contains(node) {
            return Err(StorageError::NodeUnavailable(node.to_string()));
        }
        self.get(node, key)
            .ok_or_else(|| StorageError::ObjectNotFound(key.to_string()))
    }

    async fn part_exists(&self, node: &str, key: &str) -> Result<bool, StorageError> {
        if self.failing.read().contains(node) {
            return Err(StorageError::NodeUnavailable(node.to_string()));
        }
        Ok(self.get(node, key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::fixtures::test_topology;

    /// Store that never answers
    struct StalledStore;

    #[async_trait]
    impl NodeStore for StalledStore {
        async fn put_part(&self, _: &str, _: &str, _: Arc<Vec<u8>>) -> Result<String, StorageError> {
            std::future::pending().await
        }

        async fn get_part(&self, _: &str, key: &str) -> Result<Arc<Vec<u8>>, StorageError> {
            Err(StorageError::ObjectNotFound(key.to_string()))
        }

        async fn part_exists(&self, _: &str, _: &str) -> Result<bool, StorageError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_failure() {
        let store = MemoryNodeStore::new();
        let data = Arc::new(b"chunk".to_vec());

        let etag = store.put_part("node-a", "k/part-00001", data.clone()).await.unwrap();
        assert_eq!(etag.len(), 32);
        assert!(store.part_exists("node-a", "k/part-00001").await.unwrap());
        assert_eq!(store.get("node-a", "k/part-00001").unwrap().as_slice(), b"chunk");
        assert!(!store.part_exists("node-b", "k/part-00001").await.unwrap());
        assert_eq!(store.get_part("node-a", "k/part-00001").await.unwrap().as_slice(), b"chunk");
        assert!(matches!(
            store.get_part("node-b", "k/part-00001").await,
            Err(StorageError::ObjectNotFound(_))
        ));

        store.set_failing("node-b", true);
        assert!(matches!(
            store.put_part("node-b", "k/part-00001", data).await,
            Err(StorageError::NodeUnavailable(_))
        ));
        assert_eq!(store.attempts("node-b"), 1);
        assert_eq!(store.object_count("node-b"), 0);
    }

    #[tokio::test]
    async fn test_put_with_timeout() {
        let result = put_with_timeout(
            &StalledStore,
            "node-a",
            "key",
            Arc::new(vec![1, 2, 3]),
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(StorageError::Timeout { .. })));

        let memory = MemoryNodeStore::new();
        let stored = put_with_timeout(&memory, "node-a", "key", Arc::new(vec![1, 2, 3]), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stored.size, 3);
        assert_eq!(stored.node, "node-a");
    }

    #[tokio::test]
    async fn test_s3_store_unknown_node() {
        let topology = TopologySnapshot::from_config(test_topology()).unwrap();
        let store = S3NodeStore::new(&topology, false);

        let result = store.put_part("node-z", "key", Arc::new(vec![1])).await;
        assert!(matches!(result, Err(StorageError::UnknownNode(_))));
    }

    #[tokio::test]
    async fn test_s3_store_follows_topology_through_trait() {
        let topology = TopologySnapshot::from_config(test_topology()).unwrap();
        let store = S3NodeStore::new(&topology, false);
        assert!(!store.clients.read().contains_key("node-e"));

        let mut config = test_topology();
        config.nodes.push(crate::topology::fixtures::node("node-e", "rack-3"));
        let as_trait: &dyn NodeStore = &store;
        as_trait.sync_topology(&TopologySnapshot::from_config(config).unwrap());

        assert!(store.clients.read().contains_key("node-e"));
        assert!(store.client("node-e").is_ok());
    }

    #[tokio::test]
    async fn test_s3_store_sync_reuses_unchanged_clients() {
        let topology = TopologySnapshot::from_config(test_topology()).unwrap();
        let store = S3NodeStore::new(&topology, true);
        assert_eq!(store.clients.read().len(), 4);

        let mut config = test_topology();
        config.nodes[0].endpoint = "http://moved:9000".to_string();
        config.nodes.pop();
        config.logical_nodes[1].physical_node_pair =
            vec!["node-b".to_string(), "node-c".to_string()];
        store.sync_topology(&TopologySnapshot::from_config(config).unwrap());

        let clients = store.clients.read().clone();
        assert_eq!(clients.len(), 3);
        assert_eq!(clients["node-a"].node_config().endpoint, "http://moved:9000");
        assert!(!clients.contains_key("node-d"));
    }
}
