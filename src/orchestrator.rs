//! Upload Orchestrator
//!
//! Drives one file from begin to anchored receipt:
//! - begin: quota pre-check, logical node selection, session creation
//! - chunks: placement, primary write with failover, background replica
//! - finalize: quota post-check, hash verification, ledger anchoring
//!
//! Network calls (node writes, ledger calls) never run under a session lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::chain::{ChainAdapter, ChainBackend, ChainError, ChainStatus};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::quota::{QuotaDecision, QuotaEngine};
use crate::storage::{
    part_key, put_with_timeout, DegradedWriteTracker, NodeStore, ReplicaJob, ReplicaPolicy,
    ReplicaWriter,
};
use crate::topology::{NodeHealth, PlacementResolver, WriteTarget};
use crate::upload::{
    compute_hash, ChunkManifest, NewSession, PartRecord, PartUpload, SessionStatus, UploadSession,
    UploadSessionStore, VerifiedUpload,
};

// ============================================================================
// Request and Response Types
// ============================================================================

/// Caller identity, passed explicitly to every operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Uploader identity recorded on the ledger
    pub fn uploader(&self) -> String {
        format!("{}/{}", self.tenant_id, self.user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginUpload {
    pub file_name: String,
    pub total_size: u64,
    /// Falls back to the configured chunk size
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Chosen by load when absent
    #[serde(default)]
    pub logic_node_name: Option<String>,
}

/// Outcome of one chunk write
pub struct ChunkAck {
    pub record: PartRecord,
    /// Pair member receiving the background copy
    pub replica_node: Option<String>,
    /// Resolves to whether the replica landed; dropping it detaches the copy
    pub replica: Option<JoinHandle<bool>>,
}

/// Returned once a file is completed and anchored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub upload_id: String,
    pub file_name: String,
    /// SHA-256 over the part hashes
    pub file_hash: String,
    pub total_size: u64,
    pub total_parts: u32,
    pub logic_node_name: String,
    pub transaction_hash: String,
    /// Record key assigned by the ledger
    pub ledger_file_hash: Option<String>,
    pub block_number: Option<u64>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub default_chunk_size: u64,
    /// Attempts per chunk across both pair members
    pub chunk_retry_limit: u32,
    pub node_write_timeout: Duration,
    pub ledger_timeout: Duration,
    pub replica: ReplicaPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let write_timeout = Duration::from_secs(config.upload.node_write_timeout_secs);
        Self {
            default_chunk_size: config.upload.chunk_size,
            chunk_retry_limit: config.upload.chunk_retry_limit.max(1),
            node_write_timeout: write_timeout,
            ledger_timeout: Duration::from_secs(config.chain.timeout_secs),
            replica: ReplicaPolicy {
                max_attempts: config.upload.replica_retry_limit.max(1),
                initial_backoff: Duration::from_millis(config.upload.replica_backoff_ms),
                timeout: write_timeout,
            },
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct UploadOrchestrator<C: ChainAdapter = ChainBackend> {
    inner: Arc<OrchestratorInner<C>>,
}

impl<C: ChainAdapter> Clone for UploadOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct OrchestratorInner<C> {
    sessions: UploadSessionStore,
    placement: Arc<PlacementResolver>,
    quota: QuotaEngine,
    chain: C,
    nodes: Arc<dyn NodeStore>,
    replicas: ReplicaWriter,
    settings: OrchestratorSettings,
}

impl<C: ChainAdapter> UploadOrchestrator<C> {
    pub fn new(
        placement: Arc<PlacementResolver>,
        nodes: Arc<dyn NodeStore>,
        quota: QuotaEngine,
        chain: C,
        settings: OrchestratorSettings,
    ) -> Self {
        let sessions = UploadSessionStore::new(placement.clone());
        let replicas = ReplicaWriter::new(
            nodes.clone(),
            Arc::new(DegradedWriteTracker::new()),
            settings.replica,
        );

        Self {
            inner: Arc::new(OrchestratorInner {
                sessions,
                placement,
                quota,
                chain,
                nodes,
                replicas,
                settings,
            }),
        }
    }

    pub fn sessions(&self) -> &UploadSessionStore {
        &self.inner.sessions
    }

    pub fn placement(&self) -> &Arc<PlacementResolver> {
        &self.inner.placement
    }

    pub fn replicas(&self) -> &ReplicaWriter {
        &self.inner.replicas
    }

    pub fn chain(&self) -> &C {
        &self.inner.chain
    }

    // ========================================================================
    // Begin
    // ========================================================================

    pub async fn begin_upload(&self, ctx: &TenantContext, request: BeginUpload) -> Result<UploadSession> {
        if request.total_size == 0 {
            return Err(Error::InvalidRequest("totalSize must be greater than 0".to_string()));
        }

        self.inner
            .quota
            .check(&ctx.tenant_id, &ctx.user_id, request.total_size)
            .await?;

        let logic_node_name = match request.logic_node_name {
            Some(name) => name,
            None => self.inner.placement.select_logical_node()?,
        };
        let target = self.inner.placement.resolve_write_target(&logic_node_name)?;

        self.inner
            .sessions
            .begin_session(NewSession {
                file_name: request.file_name,
                total_size: request.total_size,
                chunk_size: request.chunk_size.unwrap_or(self.inner.settings.default_chunk_size),
                metadata: request.metadata,
                logic_node_name,
                node_name: Some(target.primary),
                tenant_id: ctx.tenant_id.clone(),
                user_id: ctx.user_id.clone(),
            })
            .await
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Write one chunk to a pair member and schedule its replica.
    ///
    /// Failed attempts move to the other member. The chunk is durable once
    /// one member acknowledges it.
    pub async fn upload_chunk(
        &self,
        ctx: &TenantContext,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<ChunkAck> {
        let session = self.owned_session(ctx, upload_id).await?;
        validate_chunk(&session, part_number, data.len() as u64)?;

        let part_hash = compute_hash(&data);
        if let Some(existing) = session.part(part_number).filter(|p| p.uploaded) {
            if existing.part_hash.as_deref() != Some(part_hash.as_str())
                || existing.part_size != data.len() as u64
            {
                return Err(Error::InvalidRequest(format!(
                    "Part {} already uploaded with different content",
                    part_number
                )));
            }
            tracing::debug!(upload_id = %upload_id, part_number, "Chunk already stored");
            return Ok(ChunkAck {
                record: existing.clone(),
                replica_node: None,
                replica: None,
            });
        }

        let key = part_key(&session.object_name, part_number);
        let part_size = data.len() as u64;
        let data = Arc::new(data);
        let attempts = self.inner.settings.chunk_retry_limit;
        let mut failed: HashSet<String> = HashSet::new();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let target = self.inner.placement.resolve_write_target(&session.logic_node_name)?;
            let node = self.pick_node(&target, &failed);

            match put_with_timeout(
                self.inner.nodes.as_ref(),
                &node,
                &key,
                data.clone(),
                self.inner.settings.node_write_timeout,
            )
            .await
            {
                Ok(stored) => {
                    let record = self
                        .inner
                        .sessions
                        .record_part(
                            upload_id,
                            PartUpload {
                                part_number,
                                part_size,
                                part_hash,
                                etag: stored.etag,
                                node_name: Some(node.clone()),
                            },
                        )
                        .await?;

                    let replica_node = target.replica_for(&node).map(str::to_string);
                    let replica = replica_node.as_ref().map(|replica| {
                        self.inner.replicas.schedule(ReplicaJob {
                            upload_id: upload_id.to_string(),
                            part_number,
                            node: replica.clone(),
                            key: key.clone(),
                            data: data.clone(),
                        })
                    });

                    tracing::debug!(
                        upload_id = %upload_id,
                        part_number,
                        node = %node,
                        replica = ?replica_node,
                        attempt,
                        "Chunk stored"
                    );

                    return Ok(ChunkAck {
                        record,
                        replica_node,
                        replica,
                    });
                }
                Err(e) => {
                    last_error = format!("{}: {}", node, e);
                    failed.insert(node);
                    // Stops the loop if the session was closed meanwhile
                    self.inner
                        .sessions
                        .record_part_failure(upload_id, part_number, &last_error)
                        .await?;
                }
            }
        }

        Err(Error::ChunkWriteFailed {
            part_number,
            logic_node: session.logic_node_name,
            attempts,
            message: last_error,
        })
    }

    /// Prefer the resolved primary, then an online peer not yet tried
    fn pick_node(&self, target: &WriteTarget, failed: &HashSet<String>) -> String {
        if !failed.contains(&target.primary) {
            return target.primary.clone();
        }

        let registry = self.inner.placement.registry();
        target
            .secondary
            .as_ref()
            .filter(|s| !failed.contains(*s) && registry.health(s) == Some(NodeHealth::Online))
            .cloned()
            .unwrap_or_else(|| target.primary.clone())
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    /// Complete and anchor an upload.
    ///
    /// A ledger failure reopens the session so finalize can be retried; a
    /// quota failure aborts it.
    pub async fn finalize(
        &self,
        ctx: &TenantContext,
        upload_id: &str,
        expected_file_hash: Option<&str>,
    ) -> Result<UploadReceipt> {
        self.owned_session(ctx, upload_id).await?;

        let chain_type = self.inner.chain.chain_type();
        let healthy = tokio::time::timeout(self.inner.settings.ledger_timeout, self.inner.chain.is_healthy())
            .await
            .unwrap_or(false);
        if !healthy {
            tracing::warn!(upload_id = %upload_id, chain = %chain_type, "Ledger unhealthy, finalize refused");
            return Err(Error::LedgerUnavailable(chain_type));
        }

        let session = self.inner.sessions.begin_completion(upload_id).await?;

        match self.complete(ctx, &session, expected_file_hash).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                if !matches!(e, Error::QuotaExceeded(_)) {
                    if let Err(reopen) = self.inner.sessions.reopen_session(upload_id, &e.to_string()).await {
                        tracing::error!(upload_id = %upload_id, error = %reopen, "Failed to reopen session");
                    }
                }
                Err(e)
            }
        }
    }

    async fn complete(
        &self,
        ctx: &TenantContext,
        session: &UploadSession,
        expected_file_hash: Option<&str>,
    ) -> Result<UploadReceipt> {
        let upload_id = session.upload_id.as_str();

        // Re-check against the bytes actually stored
        if let Err(e) = self
            .inner
            .quota
            .check(&ctx.tenant_id, &ctx.user_id, session.uploaded_size)
            .await
        {
            if let Error::QuotaExceeded(decision) = &e {
                self.inner
                    .sessions
                    .abort_completion(upload_id, &decision.reason())
                    .await?;
            }
            return Err(e);
        }

        let VerifiedUpload { session, file_hash } = self
            .inner
            .sessions
            .verify_completion(upload_id, expected_file_hash)
            .await?;

        let manifest = ChunkManifest::from_session(&session, &file_hash).to_json()?;
        let param = serde_json::json!({
            "uploadId": session.upload_id,
            "fileHash": file_hash,
            "totalSize": session.uploaded_size,
            "tenantId": ctx.tenant_id,
            "userId": ctx.user_id,
            "metadata": session.metadata,
        })
        .to_string();

        let chain_type = self.inner.chain.chain_type();
        let receipt = match tokio::time::timeout(
            self.inner.settings.ledger_timeout,
            self.inner
                .chain
                .store_file(&ctx.uploader(), &session.file_name, &manifest, &param),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ChainError::Timeout {
                    chain: chain_type,
                    operation: "storeFile",
                }
                .into())
            }
        };

        let completed = self
            .inner
            .sessions
            .commit_completion(upload_id, &file_hash)
            .await?;

        if let Err(e) = self
            .inner
            .quota
            .usage_store()
            .record_write(&ctx.tenant_id, &ctx.user_id, completed.uploaded_size)
            .await
        {
            tracing::warn!(
                upload_id = %upload_id,
                tenant_id = %ctx.tenant_id,
                user_id = %ctx.user_id,
                error = %e,
                "Failed to update usage counters"
            );
        }

        tracing::info!(
            upload_id = %upload_id,
            file_hash = %file_hash,
            transaction_hash = %receipt.transaction_hash,
            chain = %chain_type,
            "Upload anchored"
        );

        Ok(UploadReceipt {
            upload_id: completed.upload_id,
            file_name: completed.file_name,
            file_hash,
            total_size: completed.uploaded_size,
            total_parts: completed.total_parts,
            logic_node_name: completed.logic_node_name,
            transaction_hash: receipt.transaction_hash,
            ledger_file_hash: receipt.file_hash,
            block_number: receipt.block_number,
            completed_at: completed.update_time,
        })
    }

    // ========================================================================
    // Abort and Queries
    // ========================================================================

    pub async fn abort(&self, ctx: &TenantContext, upload_id: &str, reason: &str) -> Result<UploadSession> {
        self.owned_session(ctx, upload_id).await?;
        self.inner.sessions.abort_session(upload_id, reason).await
    }

    pub async fn get_session(&self, ctx: &TenantContext, upload_id: &str) -> Result<UploadSession> {
        self.owned_session(ctx, upload_id).await
    }

    pub async fn list_uploaded_parts(&self, ctx: &TenantContext, upload_id: &str) -> Result<Vec<PartRecord>> {
        self.owned_session(ctx, upload_id).await?;
        self.inner.sessions.list_uploaded_parts(upload_id).await
    }

    pub async fn list_sessions(&self, ctx: &TenantContext) -> Vec<UploadSession> {
        self.inner
            .sessions
            .list_sessions(&ctx.tenant_id, &ctx.user_id)
            .await
    }

    pub async fn quota_status(&self, ctx: &TenantContext) -> Result<QuotaDecision> {
        self.inner.quota.quota_status(&ctx.tenant_id, &ctx.user_id).await
    }

    pub async fn chain_status(&self) -> ChainStatus {
        self.inner.chain.get_chain_status().await
    }

    /// Sessions of other callers are reported as missing
    async fn owned_session(&self, ctx: &TenantContext, upload_id: &str) -> Result<UploadSession> {
        let session = self.inner.sessions.get_session(upload_id).await?;
        if !session.owned_by(&ctx.tenant_id, &ctx.user_id) {
            return Err(Error::SessionNotFound(upload_id.to_string()));
        }
        Ok(session)
    }
}

fn validate_chunk(session: &UploadSession, part_number: u32, size: u64) -> Result<()> {
    if session.status.is_terminal() {
        return Err(Error::SessionClosed {
            upload_id: session.upload_id.clone(),
            status: session.status,
        });
    }
    if session.status == SessionStatus::Completing {
        return Err(Error::InvalidRequest(format!(
            "Upload {} is being finalized",
            session.upload_id
        )));
    }
    if part_number == 0 || part_number > session.total_parts {
        return Err(Error::InvalidPartNumber {
            part_number,
            total_parts: session.total_parts,
        });
    }
    if size == 0 {
        return Err(Error::InvalidRequest("chunk must not be empty".to_string()));
    }
    if size > session.chunk_size {
        return Err(Error::InvalidRequest(format!(
            "chunk of {} bytes exceeds chunkSize {}",
            size, session.chunk_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainErrorKind, InMemoryLedger};
    use crate::quota::{
        EnforcementMode, InMemoryUsageStore, QuotaLimits, QuotaPolicies, QuotaUsage, UsageStore,
    };
    use crate::storage::MemoryNodeStore;
    use crate::topology::{fixtures, LoadWeights, NodeTopologyChangeEvent, TopologySnapshot};

    const MB: u64 = 1024 * 1024;

    struct Harness {
        orchestrator: UploadOrchestrator<InMemoryLedger>,
        ledger: InMemoryLedger,
        nodes: Arc<MemoryNodeStore>,
        usage: Arc<InMemoryUsageStore>,
        ctx: TenantContext,
    }

    /// Usage store whose reads take `delay`
    struct SlowUsageStore {
        inner: Arc<InMemoryUsageStore>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl UsageStore for SlowUsageStore {
        async fn get_usage(&self, tenant_id: &str, user_id: &str) -> Result<crate::quota::UsageSnapshot> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_usage(tenant_id, user_id).await
        }

        async fn record_write(&self, tenant_id: &str, user_id: &str, bytes: u64) -> Result<()> {
            self.inner.record_write(tenant_id, user_id, bytes).await
        }

        async fn record_delete(&self, tenant_id: &str, user_id: &str, bytes: u64) -> Result<()> {
            self.inner.record_delete(tenant_id, user_id, bytes).await
        }
    }

    fn harness_with(policies: QuotaPolicies) -> Harness {
        harness_with_usage_delay(policies, Duration::ZERO)
    }

    fn harness_with_usage_delay(policies: QuotaPolicies, usage_delay: Duration) -> Harness {
        let topology = TopologySnapshot::from_config(fixtures::test_topology()).unwrap();
        let placement = Arc::new(PlacementResolver::from_snapshot(topology, LoadWeights::default()));
        let nodes = Arc::new(MemoryNodeStore::new());
        let usage = Arc::new(InMemoryUsageStore::new());
        let slow = Arc::new(SlowUsageStore {
            inner: usage.clone(),
            delay: usage_delay,
        });
        let quota = QuotaEngine::new(slow, policies, EnforcementMode::Enforce);
        let ledger = InMemoryLedger::new();

        let settings = OrchestratorSettings {
            ledger_timeout: Duration::from_secs(2),
            replica: ReplicaPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                timeout: Duration::from_secs(2),
            },
            ..OrchestratorSettings::default()
        };

        Harness {
            orchestrator: UploadOrchestrator::new(placement, nodes.clone(), quota, ledger.clone(), settings),
            ledger,
            nodes,
            usage,
            ctx: TenantContext::new("tenant-1", "user-1"),
        }
    }

    fn harness() -> Harness {
        harness_with(QuotaPolicies::default())
    }

    fn request(total_size: u64, chunk_size: u64) -> BeginUpload {
        BeginUpload {
            file_name: "scan.tiff".to_string(),
            total_size,
            chunk_size: Some(chunk_size),
            metadata: HashMap::new(),
            logic_node_name: Some("logic-1".to_string()),
        }
    }

    fn chunk(byte: u8, len: u64) -> Vec<u8> {
        vec![byte; len as usize]
    }

    #[tokio::test]
    async fn test_fifteen_megabyte_upload_in_three_chunks() {
        let h = harness();
        let o = &h.orchestrator;

        let session = o.begin_upload(&h.ctx, request(15 * MB, 5 * MB)).await.unwrap();
        assert_eq!(session.total_parts, 3);
        assert_eq!(session.node_name, "node-a");
        let id = session.upload_id;

        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5 * MB)).await.unwrap();
        o.upload_chunk(&h.ctx, &id, 3, chunk(3, 5 * MB)).await.unwrap();

        match o.finalize(&h.ctx, &id, None).await {
            Err(Error::IncompleteUpload { missing, .. }) => assert_eq!(missing, vec![2]),
            other => panic!("expected IncompleteUpload, got {:?}", other.map(|r| r.upload_id)),
        }
        assert_eq!(o.get_session(&h.ctx, &id).await.unwrap().status, SessionStatus::Uploading);

        let ack = o.upload_chunk(&h.ctx, &id, 2, chunk(2, 5 * MB)).await.unwrap();
        assert_eq!(ack.replica_node.as_deref(), Some("node-b"));
        assert!(ack.replica.unwrap().await.unwrap());

        let receipt = o.finalize(&h.ctx, &id, None).await.unwrap();
        assert_eq!(receipt.total_parts, 3);
        assert_eq!(receipt.total_size, 15 * MB);
        assert!(receipt.ledger_file_hash.is_some());

        let session = o.get_session(&h.ctx, &id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.file_hash.as_deref(), Some(receipt.file_hash.as_str()));
        assert_eq!(session.uploaded_size, 15 * MB);

        let files = h.ledger.get_user_files("tenant-1/user-1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "scan.tiff");

        let usage = h.usage.get_usage("tenant-1", "user-1").await.unwrap();
        assert_eq!(usage.user, QuotaUsage { storage_bytes: 15 * MB, file_count: 1 });
    }

    #[tokio::test]
    async fn test_anchored_manifest_lists_every_part() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(10, 5)).await.unwrap().upload_id;
        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();
        o.upload_chunk(&h.ctx, &id, 2, chunk(2, 5)).await.unwrap();

        let receipt = o.finalize(&h.ctx, &id, None).await.unwrap();
        let detail = h
            .ledger
            .get_file("tenant-1/user-1", receipt.ledger_file_hash.as_deref().unwrap())
            .await
            .unwrap();

        let manifest: ChunkManifest = serde_json::from_str(&detail.content).unwrap();
        assert_eq!(manifest.file_hash, receipt.file_hash);
        assert_eq!(manifest.parts.len(), 2);
        assert!(manifest.parts[0].location.starts_with("node/logic-1/"));
        assert!(detail.param.contains(&id));
    }

    #[tokio::test]
    async fn test_identical_chunk_resubmission_skips_write() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(10, 5)).await.unwrap().upload_id;

        o.upload_chunk(&h.ctx, &id, 1, chunk(7, 5)).await.unwrap();
        let writes = h.nodes.attempts("node-a");

        let again = o.upload_chunk(&h.ctx, &id, 1, chunk(7, 5)).await.unwrap();
        assert!(again.record.uploaded);
        assert!(again.replica.is_none());
        assert_eq!(h.nodes.attempts("node-a"), writes);

        let conflict = o.upload_chunk(&h.ctx, &id, 1, chunk(8, 5)).await;
        assert!(matches!(conflict, Err(Error::InvalidRequest(_))));
        assert_eq!(o.get_session(&h.ctx, &id).await.unwrap().uploaded_size, 5);
    }

    #[tokio::test]
    async fn test_chunk_validation() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(10, 5)).await.unwrap().upload_id;

        assert!(matches!(
            o.upload_chunk(&h.ctx, &id, 3, chunk(1, 5)).await,
            Err(Error::InvalidPartNumber { part_number: 3, total_parts: 2 })
        ));
        assert!(matches!(
            o.upload_chunk(&h.ctx, &id, 1, chunk(1, 6)).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            o.begin_upload(&h.ctx, request(0, 5)).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_primary_failure_fails_over_to_secondary() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;

        h.nodes.set_failing("node-a", true);
        let ack = o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();

        assert_eq!(ack.record.node_name.as_deref(), Some("node-b"));
        assert_eq!(ack.record.retry_count, 1);
        assert!(ack.record.error_message.is_none());
        assert_eq!(ack.replica_node.as_deref(), Some("node-a"));

        // The copy back to the failing primary is tracked as degraded
        assert!(!ack.replica.unwrap().await.unwrap());
        let key = part_key(&o.get_session(&h.ctx, &id).await.unwrap().object_name, 1);
        assert!(o.replicas().tracker().contains("node-a", &key));
        assert!(h.nodes.get("node-b", &key).is_some());
    }

    #[tokio::test]
    async fn test_offline_primary_routes_to_secondary() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;

        o.placement()
            .apply_topology_event(&NodeTopologyChangeEvent::offline("node-a"));
        let ack = o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();

        assert_eq!(ack.record.node_name.as_deref(), Some("node-b"));
        assert_eq!(ack.record.retry_count, 0);
        assert_eq!(ack.replica_node.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_both_members_failing_exhausts_retries() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;

        h.nodes.set_failing("node-a", true);
        h.nodes.set_failing("node-b", true);

        match o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await {
            Err(Error::ChunkWriteFailed { part_number, attempts, .. }) => {
                assert_eq!(part_number, 1);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected ChunkWriteFailed, got {:?}", other.map(|a| a.record)),
        }

        let session = o.get_session(&h.ctx, &id).await.unwrap();
        let part = session.part(1).unwrap();
        assert!(!part.uploaded);
        assert_eq!(part.retry_count, 3);
        assert!(part.error_message.is_some());
        assert_eq!(session.uploaded_size, 0);
    }

    #[tokio::test]
    async fn test_degraded_replica_does_not_fail_upload() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;

        h.nodes.set_failing("node-b", true);
        let ack = o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();
        assert!(ack.record.uploaded);
        assert!(!ack.replica.unwrap().await.unwrap());

        assert_eq!(o.replicas().tracker().for_node("node-b").len(), 1);
        assert!(o.finalize(&h.ctx, &id, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_ledger_keeps_session_uploading() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;
        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();

        h.ledger.set_healthy(false);
        let result = o.finalize(&h.ctx, &id, None).await;
        assert!(matches!(result, Err(Error::LedgerUnavailable(crate::chain::ChainType::Memory))));
        assert_eq!(o.get_session(&h.ctx, &id).await.unwrap().status, SessionStatus::Uploading);

        h.ledger.set_healthy(true);
        assert!(o.finalize(&h.ctx, &id, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_anchoring_failure_allows_retry() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;
        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();

        h.ledger.fail_next_stores(1);
        match o.finalize(&h.ctx, &id, None).await {
            Err(Error::Chain(e)) => assert_eq!(e.kind(), ChainErrorKind::Io),
            other => panic!("expected chain error, got {:?}", other.map(|r| r.upload_id)),
        }

        let session = o.get_session(&h.ctx, &id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Uploading);
        assert!(session.file_hash.is_none());
        assert_eq!(h.usage.get_usage("tenant-1", "user-1").await.unwrap().user.file_count, 0);

        let receipt = o.finalize(&h.ctx, &id, None).await.unwrap();
        assert_eq!(o.get_session(&h.ctx, &id).await.unwrap().status, SessionStatus::Completed);
        assert_eq!(h.ledger.file_count(), 1);
        assert!(!receipt.transaction_hash.is_empty());
    }

    #[tokio::test]
    async fn test_ledger_timeout_maps_to_chain_timeout() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;
        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();

        h.ledger.set_store_delay(Some(Duration::from_secs(5)));
        let err = o.finalize(&h.ctx, &id, None).await.err().unwrap();
        assert_eq!(err.code(), "CHAIN_TIMEOUT");
        assert!(err.is_retryable());
        assert_eq!(o.get_session(&h.ctx, &id).await.unwrap().status, SessionStatus::Uploading);
    }

    #[tokio::test]
    async fn test_quota_rejects_begin() {
        let h = harness_with(QuotaPolicies {
            default_user: QuotaLimits::new(10 * MB, 100),
            ..QuotaPolicies::default()
        });

        let result = h.orchestrator.begin_upload(&h.ctx, request(11 * MB, 5 * MB)).await;
        match result {
            Err(Error::QuotaExceeded(decision)) => assert!(decision.user_storage_exceeded),
            other => panic!("expected QuotaExceeded, got {:?}", other.map(|s| s.upload_id)),
        }
        assert_eq!(h.orchestrator.sessions().active_count().await, 0);
    }

    #[tokio::test]
    async fn test_quota_post_check_aborts_session() {
        let h = harness_with(QuotaPolicies {
            default_user: QuotaLimits::new(10, 100),
            ..QuotaPolicies::default()
        });
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(10, 5)).await.unwrap().upload_id;
        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();
        o.upload_chunk(&h.ctx, &id, 2, chunk(2, 5)).await.unwrap();

        // Another upload landed in the meantime
        h.usage
            .record_write("tenant-1", "user-1", 4)
            .await
            .unwrap();

        let err = o.finalize(&h.ctx, &id, None).await.err().unwrap();
        let reason = match &err {
            Error::QuotaExceeded(decision) => decision.reason(),
            other => panic!("expected QuotaExceeded, got {:?}", other),
        };

        let session = o.get_session(&h.ctx, &id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Aborted);
        assert_eq!(session.abort_reason.as_deref(), Some(reason.as_str()));
        assert_eq!(h.ledger.file_count(), 0);
    }

    #[tokio::test]
    async fn test_expected_hash_mismatch_reopens_session() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;
        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();

        let result = o.finalize(&h.ctx, &id, Some("0xdeadbeef")).await;
        assert!(matches!(result, Err(Error::HashMismatch { .. })));
        assert_eq!(o.get_session(&h.ctx, &id).await.unwrap().status, SessionStatus::Uploading);
    }

    #[tokio::test]
    async fn test_concurrent_finalize_is_rejected() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;
        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();

        h.ledger.set_store_delay(Some(Duration::from_millis(200)));
        let first = {
            let o = o.clone();
            let ctx = h.ctx.clone();
            let id = id.clone();
            tokio::spawn(async move { o.finalize(&ctx, &id, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = o.finalize(&h.ctx, &id, None).await;
        assert!(matches!(second, Err(Error::InvalidRequest(_))));

        let receipt = first.await.unwrap().unwrap();
        assert_eq!(receipt.upload_id, id);
        assert_eq!(h.ledger.file_count(), 1);
    }

    #[tokio::test]
    async fn test_chunks_rejected_while_finalizing() {
        let h = harness_with_usage_delay(
            QuotaPolicies {
                default_user: QuotaLimits::new(7, 100),
                ..QuotaPolicies::default()
            },
            Duration::from_millis(200),
        );
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(6, 5)).await.unwrap().upload_id;
        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();

        let finalize = {
            let o = o.clone();
            let ctx = h.ctx.clone();
            let id = id.clone();
            tokio::spawn(async move { o.finalize(&ctx, &id, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(o.get_session(&h.ctx, &id).await.unwrap().status, SessionStatus::Completing);

        // Five more bytes would take the user past seven
        let late = o.upload_chunk(&h.ctx, &id, 2, chunk(2, 5)).await;
        assert!(matches!(late, Err(Error::InvalidRequest(_))));
        assert_eq!(h.nodes.attempts("node-a"), 1);

        match finalize.await.unwrap() {
            Err(Error::IncompleteUpload { missing, .. }) => assert_eq!(missing, vec![2]),
            other => panic!("expected IncompleteUpload, got {:?}", other.map(|r| r.upload_id)),
        }
        let session = o.get_session(&h.ctx, &id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Uploading);
        assert_eq!(session.uploaded_size, 5);
        assert_eq!(h.ledger.file_count(), 0);

        o.upload_chunk(&h.ctx, &id, 2, chunk(2, 1)).await.unwrap();
        let receipt = o.finalize(&h.ctx, &id, None).await.unwrap();
        assert_eq!(receipt.total_size, 6);
    }

    #[tokio::test]
    async fn test_abort_refused_while_anchoring() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;
        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();

        h.ledger.set_store_delay(Some(Duration::from_millis(300)));
        let finalize = {
            let o = o.clone();
            let ctx = h.ctx.clone();
            let id = id.clone();
            tokio::spawn(async move { o.finalize(&ctx, &id, None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let abort = o.abort(&h.ctx, &id, "user cancelled").await;
        assert!(matches!(abort, Err(Error::InvalidRequest(_))));

        let receipt = finalize.await.unwrap().unwrap();
        let session = o.get_session(&h.ctx, &id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.file_hash.as_deref(), Some(receipt.file_hash.as_str()));
        assert_eq!(h.ledger.file_count(), 1);
        assert_eq!(h.usage.get_usage("tenant-1", "user-1").await.unwrap().user.file_count, 1);

        assert!(matches!(
            o.abort(&h.ctx, &id, "too late").await,
            Err(Error::SessionClosed { status: SessionStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_see_session() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(5, 5)).await.unwrap().upload_id;
        let stranger = TenantContext::new("tenant-2", "user-1");

        assert!(matches!(
            o.get_session(&stranger, &id).await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            o.upload_chunk(&stranger, &id, 1, chunk(1, 5)).await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            o.abort(&stranger, &id, "nope").await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(o.list_sessions(&stranger).await.is_empty());
        assert_eq!(o.list_sessions(&h.ctx).await.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_rejects_late_chunks() {
        let h = harness();
        let o = &h.orchestrator;
        let id = o.begin_upload(&h.ctx, request(10, 5)).await.unwrap().upload_id;
        o.upload_chunk(&h.ctx, &id, 1, chunk(1, 5)).await.unwrap();

        let aborted = o.abort(&h.ctx, &id, "user cancelled").await.unwrap();
        assert_eq!(aborted.status, SessionStatus::Aborted);

        assert!(matches!(
            o.upload_chunk(&h.ctx, &id, 2, chunk(2, 5)).await,
            Err(Error::SessionClosed { status: SessionStatus::Aborted, .. })
        ));
        assert!(o.finalize(&h.ctx, &id, None).await.is_err());
        assert_eq!(o.list_uploaded_parts(&h.ctx, &id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_begin_selects_logical_node_by_load() {
        let h = harness();
        let o = &h.orchestrator;
        o.placement()
            .apply_topology_event(&NodeTopologyChangeEvent::offline("node-a"));

        let session = o
            .begin_upload(
                &h.ctx,
                BeginUpload {
                    logic_node_name: None,
                    ..request(5, 5)
                },
            )
            .await
            .unwrap();
        assert_eq!(session.logic_node_name, "logic-2");

        let status = o.quota_status(&h.ctx).await.unwrap();
        assert!(!status.exceeded);
        assert!(o.chain_status().await.healthy);
    }
}
