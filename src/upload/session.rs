//! Upload Session Store
//!
//! Owns upload sessions and their part records:
//! - One lock per session, so mutations of a session are serialized while
//!   different sessions proceed in parallel
//! - Network I/O never happens while a session lock is held
//! - Stale session cleanup

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::object_name;

use super::manifest::{normalize_hash, session_file_hash};
use super::types::{
    total_parts, NewSession, PartRecord, PartUpload, SessionStatus, UploadSession,
};

/// Answers whether a logical node is part of the current topology
pub trait LogicalNodeDirectory: Send + Sync {
    fn has_logical_node(&self, name: &str) -> bool;
}

/// A session whose parts are complete and whose hash has been checked
#[derive(Debug, Clone)]
pub struct VerifiedUpload {
    pub session: UploadSession,
    pub file_hash: String,
}

// ============================================================================
// Session Store
// ============================================================================

#[derive(Clone)]
pub struct UploadSessionStore {
    inner: Arc<SessionStoreInner>,
}

struct SessionStoreInner {
    /// Sessions indexed by upload ID, each behind its own lock
    sessions: RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>,

    directory: Arc<dyn LogicalNodeDirectory>,
}

impl UploadSessionStore {
    pub fn new(directory: Arc<dyn LogicalNodeDirectory>) -> Self {
        Self {
            inner: Arc::new(SessionStoreInner {
                sessions: RwLock::new(HashMap::new()),
                directory,
            }),
        }
    }

    async fn entry(&self, upload_id: &str) -> Result<Arc<Mutex<UploadSession>>> {
        self.inner
            .sessions
            .read()
            .await
            .get(upload_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(upload_id.to_string()))
    }

    fn ensure_open(session: &UploadSession) -> Result<()> {
        if session.status.is_terminal() {
            return Err(Error::SessionClosed {
                upload_id: session.upload_id.clone(),
                status: session.status,
            });
        }
        Ok(())
    }

    /// Parts may not change once finalize has taken the session
    fn ensure_accepting_parts(session: &UploadSession) -> Result<()> {
        Self::ensure_open(session)?;
        if session.status == SessionStatus::Completing {
            return Err(Error::InvalidRequest(format!(
                "Upload {} is being finalized",
                session.upload_id
            )));
        }
        Ok(())
    }

    fn ensure_part_number(session: &UploadSession, part_number: u32) -> Result<()> {
        if part_number == 0 || part_number > session.total_parts {
            return Err(Error::InvalidPartNumber {
                part_number,
                total_parts: session.total_parts,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a session and move it to UPLOADING
    pub async fn begin_session(&self, request: NewSession) -> Result<UploadSession> {
        if request.chunk_size == 0 {
            return Err(Error::InvalidRequest("chunkSize must be greater than 0".to_string()));
        }
        if request.total_size == 0 {
            return Err(Error::InvalidRequest("totalSize must be greater than 0".to_string()));
        }
        if request.file_name.trim().is_empty() {
            return Err(Error::InvalidRequest("fileName is required".to_string()));
        }
        if !self.inner.directory.has_logical_node(&request.logic_node_name) {
            return Err(Error::InvalidRequest(format!(
                "Unknown logical node: {}",
                request.logic_node_name
            )));
        }
        let part_count = total_parts(request.total_size, request.chunk_size).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "too many parts: totalSize {} at chunkSize {}",
                request.total_size, request.chunk_size
            ))
        })?;

        let upload_id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let node_name = request.node_name.unwrap_or_default();

        let mut session = UploadSession {
            object_name: object_name(&upload_id, &request.file_name, now),
            upload_id: upload_id.clone(),
            file_name: request.file_name,
            file_hash: None,
            total_size: request.total_size,
            chunk_size: request.chunk_size,
            total_parts: part_count,
            bucket_name: node_name.clone(),
            metadata: request.metadata,
            create_time: now,
            update_time: now,
            status: SessionStatus::Initializing,
            node_name,
            logic_node_name: request.logic_node_name,
            uploaded_parts: Vec::new(),
            uploaded_size: 0,
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            abort_reason: None,
        };
        session.status = SessionStatus::Uploading;

        self.inner
            .sessions
            .write()
            .await
            .insert(upload_id.clone(), Arc::new(Mutex::new(session.clone())));

        tracing::info!(
            upload_id = %upload_id,
            file_name = %session.file_name,
            total_size = session.total_size,
            total_parts = session.total_parts,
            logic_node = %session.logic_node_name,
            "Created upload session"
        );

        Ok(session)
    }

    /// Mark a part uploaded. Re-submitting an identical uploaded part is a no-op.
    pub async fn record_part(&self, upload_id: &str, part: PartUpload) -> Result<PartRecord> {
        let entry = self.entry(upload_id).await?;
        let mut session = entry.lock().await;

        Self::ensure_accepting_parts(&session)?;
        Self::ensure_part_number(&session, part.part_number)?;
        if part.part_size == 0 {
            return Err(Error::InvalidRequest("partSize must be greater than 0".to_string()));
        }

        let part_hash = normalize_hash(&part.part_hash);

        if let Some(existing) = session.part(part.part_number).filter(|p| p.uploaded) {
            if existing.part_size == part.part_size
                && existing.part_hash.as_deref() == Some(part_hash.as_str())
            {
                return Ok(existing.clone());
            }
            return Err(Error::InvalidRequest(format!(
                "Part {} already uploaded with different content",
                part.part_number
            )));
        }

        let now = Utc::now();
        let record = {
            let record = session.part_entry(part.part_number);
            record.part_size = part.part_size;
            record.part_hash = Some(part_hash);
            record.etag = Some(part.etag);
            record.upload_time = Some(now);
            record.uploaded = true;
            record.error_message = None;
            record.node_name = part.node_name.clone();
            record.clone()
        };

        session.recompute_uploaded_size();
        session.update_time = now;
        if let Some(node) = part.node_name {
            session.node_name = node.clone();
            session.bucket_name = node;
        }

        tracing::debug!(
            upload_id = %upload_id,
            part_number = record.part_number,
            part_size = record.part_size,
            uploaded_size = session.uploaded_size,
            "Recorded part"
        );

        Ok(record)
    }

    /// Record a failed attempt for a part
    pub async fn record_part_failure(
        &self,
        upload_id: &str,
        part_number: u32,
        error_message: &str,
    ) -> Result<PartRecord> {
        let entry = self.entry(upload_id).await?;
        let mut session = entry.lock().await;

        Self::ensure_accepting_parts(&session)?;
        Self::ensure_part_number(&session, part_number)?;

        let record = {
            let record = session.part_entry(part_number);
            record.retry_count += 1;
            // An earlier acknowledged write stays valid
            if !record.uploaded {
                record.error_message = Some(error_message.to_string());
            }
            record.clone()
        };
        session.update_time = Utc::now();

        tracing::warn!(
            upload_id = %upload_id,
            part_number,
            retry_count = record.retry_count,
            error = %error_message,
            "Part upload attempt failed"
        );

        Ok(record)
    }

    /// Move an UPLOADING session to COMPLETING. Only one finalize may hold a
    /// session at a time.
    pub async fn begin_completion(&self, upload_id: &str) -> Result<UploadSession> {
        let entry = self.entry(upload_id).await?;
        let mut session = entry.lock().await;

        Self::ensure_open(&session)?;
        if session.status == SessionStatus::Completing {
            return Err(Error::InvalidRequest(format!(
                "Upload {} is already being finalized",
                upload_id
            )));
        }

        session.status = SessionStatus::Completing;
        session.update_time = Utc::now();
        Ok(session.clone())
    }

    /// Return a COMPLETING session to UPLOADING so finalize can be retried
    pub async fn reopen_session(&self, upload_id: &str, reason: &str) -> Result<UploadSession> {
        let entry = self.entry(upload_id).await?;
        let mut session = entry.lock().await;

        if session.status == SessionStatus::Completing {
            session.status = SessionStatus::Uploading;
            session.update_time = Utc::now();
            tracing::warn!(upload_id = %upload_id, reason = %reason, "Finalize failed, session reopened");
        }
        Ok(session.clone())
    }

    /// Abort a session that finalize currently holds
    pub async fn abort_completion(&self, upload_id: &str, reason: &str) -> Result<UploadSession> {
        let entry = self.entry(upload_id).await?;
        let mut session = entry.lock().await;

        if session.status != SessionStatus::Completing {
            return Err(Error::InvalidRequest(format!(
                "Upload {} is not being finalized",
                upload_id
            )));
        }

        session.status = SessionStatus::Aborted;
        session.abort_reason = Some(reason.to_string());
        session.update_time = Utc::now();

        tracing::info!(upload_id = %upload_id, reason = %reason, "Upload session aborted during finalize");

        Ok(session.clone())
    }

    /// Check completeness and the file hash without changing the session
    pub async fn verify_completion(
        &self,
        upload_id: &str,
        expected_file_hash: Option<&str>,
    ) -> Result<VerifiedUpload> {
        let entry = self.entry(upload_id).await?;
        let session = entry.lock().await;
        Self::verify_locked(&session, expected_file_hash)
    }

    fn verify_locked(
        session: &UploadSession,
        expected_file_hash: Option<&str>,
    ) -> Result<VerifiedUpload> {
        Self::ensure_open(session)?;

        let missing = session.missing_parts();
        if !missing.is_empty() {
            return Err(Error::IncompleteUpload {
                upload_id: session.upload_id.clone(),
                missing,
            });
        }

        let file_hash = session_file_hash(session);
        if let Some(expected) = expected_file_hash {
            let expected = normalize_hash(expected);
            if expected != file_hash {
                return Err(Error::HashMismatch {
                    expected,
                    actual: file_hash,
                });
            }
        }

        Ok(VerifiedUpload {
            session: session.clone(),
            file_hash,
        })
    }

    /// Mark a verified session COMPLETED
    pub async fn commit_completion(&self, upload_id: &str, file_hash: &str) -> Result<UploadSession> {
        let entry = self.entry(upload_id).await?;
        let mut session = entry.lock().await;
        Self::complete_locked(&mut session, Some(file_hash))
    }

    fn complete_locked(session: &mut UploadSession, expected: Option<&str>) -> Result<UploadSession> {
        let verified = Self::verify_locked(session, expected)?;

        session.status = SessionStatus::Completed;
        session.file_hash = Some(verified.file_hash);
        session.update_time = Utc::now();

        tracing::info!(
            upload_id = %session.upload_id,
            file_name = %session.file_name,
            uploaded_size = session.uploaded_size,
            "Upload session completed"
        );

        Ok(session.clone())
    }

    /// Verify and complete in one step
    pub async fn finalize_session(
        &self,
        upload_id: &str,
        expected_file_hash: Option<&str>,
    ) -> Result<UploadSession> {
        let entry = self.entry(upload_id).await?;
        let mut session = entry.lock().await;
        Self::complete_locked(&mut session, expected_file_hash)
    }

    /// Abort a session. Aborting an aborted session is a no-op.
    pub async fn abort_session(&self, upload_id: &str, reason: &str) -> Result<UploadSession> {
        let entry = self.entry(upload_id).await?;
        let mut session = entry.lock().await;

        match session.status {
            SessionStatus::Aborted => return Ok(session.clone()),
            SessionStatus::Completed => {
                return Err(Error::SessionClosed {
                    upload_id: upload_id.to_string(),
                    status: session.status,
                })
            }
            SessionStatus::Completing => {
                return Err(Error::InvalidRequest(format!(
                    "Upload {} is being finalized",
                    upload_id
                )))
            }
            _ => {}
        }

        session.status = SessionStatus::Aborted;
        session.abort_reason = Some(reason.to_string());
        session.update_time = Utc::now();

        tracing::info!(
            upload_id = %upload_id,
            reason = %reason,
            uploaded_parts = session.uploaded_part_count(),
            "Upload session aborted"
        );

        Ok(session.clone())
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    pub async fn get_session(&self, upload_id: &str) -> Result<UploadSession> {
        let entry = self.entry(upload_id).await?;
        let session = entry.lock().await;
        Ok(session.clone())
    }

    /// Uploaded parts in part order
    pub async fn list_uploaded_parts(&self, upload_id: &str) -> Result<Vec<PartRecord>> {
        let session = self.get_session(upload_id).await?;
        Ok(session
            .uploaded_parts
            .into_iter()
            .filter(|p| p.uploaded)
            .collect())
    }

    async fn all_entries(&self) -> Vec<Arc<Mutex<UploadSession>>> {
        self.inner.sessions.read().await.values().cloned().collect()
    }

    /// Number of sessions still accepting parts
    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for entry in self.all_entries().await {
            if !entry.lock().await.status.is_terminal() {
                count += 1;
            }
        }
        count
    }

    /// Sessions owned by a user, newest first
    pub async fn list_sessions(&self, tenant_id: &str, user_id: &str) -> Vec<UploadSession> {
        let mut sessions = Vec::new();
        for entry in self.all_entries().await {
            let session = entry.lock().await;
            if session.owned_by(tenant_id, user_id) {
                sessions.push(session.clone());
            }
        }
        sessions.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        sessions
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Abort sessions idle longer than `ttl` and evict terminal sessions
    /// older than twice that. Returns (aborted, evicted).
    pub async fn cleanup_stale(&self, ttl: ChronoDuration) -> (usize, usize) {
        let now = Utc::now();
        let mut aborted = 0;
        let mut evict = Vec::new();

        for entry in self.all_entries().await {
            let mut session = entry.lock().await;
            let idle = now - session.update_time;

            if session.status == SessionStatus::Completing {
                continue;
            }
            if !session.status.is_terminal() && idle > ttl {
                session.status = SessionStatus::Aborted;
                session.abort_reason = Some("expired".to_string());
                session.update_time = now;
                aborted += 1;
                tracing::info!(upload_id = %session.upload_id, "Expired idle upload session");
            } else if session.status.is_terminal() && idle > ttl * 2 {
                evict.push(session.upload_id.clone());
            }
        }

        if !evict.is_empty() {
            let mut sessions = self.inner.sessions.write().await;
            for id in &evict {
                sessions.remove(id);
            }
        }

        (aborted, evict.len())
    }

    /// Run `cleanup_stale` periodically
    pub fn start_cleanup_task(self, ttl: ChronoDuration, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let (aborted, evicted) = self.cleanup_stale(ttl).await;
                if aborted > 0 || evicted > 0 {
                    tracing::info!(aborted, evicted, "Cleaned up upload sessions");
                }
            }
        })
    }

    /// Write a JSON snapshot of every session, for audit
    pub async fn export_json(&self, path: &Path) -> Result<usize> {
        let mut sessions = Vec::new();
        for entry in self.all_entries().await {
            sessions.push(entry.lock().await.clone());
        }
        sessions.sort_by(|a, b| a.create_time.cmp(&b.create_time));

        let body = serde_json::to_vec_pretty(&sessions)?;
        tokio::fs::write(path, body)
            .await
            .map_err(|e| Error::Storage(crate::storage::StorageError::Io(e.to_string())))?;
        Ok(sessions.len())
    }
}
