//! Upload session types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Recommended chunk size: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Number of chunks needed for `total_size` bytes. `None` when the count
/// does not fit a part number.
pub fn total_parts(total_size: u64, chunk_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(total_size.div_ceil(chunk_size)).ok()
}

// ============================================================================
// Requests
// ============================================================================

/// Parameters for a new upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub logic_node_name: String,
    /// Physical node chosen for the first write
    #[serde(default)]
    pub node_name: Option<String>,
    pub tenant_id: String,
    pub user_id: String,
}

/// A chunk that a storage node has acknowledged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUpload {
    pub part_number: u32,
    pub part_size: u64,
    pub part_hash: String,
    pub etag: String,
    #[serde(default)]
    pub node_name: Option<String>,
}

// ============================================================================
// Session Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Initializing,
    Uploading,
    /// Finalize in progress; falls back to UPLOADING if anchoring fails
    Completing,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Status only moves forward, except a failed finalize reopening the session
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::Uploading)
                | (Self::Initializing, Self::Aborted)
                | (Self::Uploading, Self::Completing)
                | (Self::Uploading, Self::Completed)
                | (Self::Uploading, Self::Aborted)
                | (Self::Completing, Self::Uploading)
                | (Self::Completing, Self::Completed)
                | (Self::Completing, Self::Aborted)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "INITIALIZING",
            Self::Uploading => "UPLOADING",
            Self::Completing => "COMPLETING",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Status of one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    /// 1-based
    pub part_number: u32,
    pub part_size: u64,
    pub etag: Option<String>,
    /// SHA-256 of the chunk
    pub part_hash: Option<String>,
    pub upload_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub uploaded: bool,
    pub error_message: Option<String>,
    /// Physical node that acknowledged the write
    pub node_name: Option<String>,
}

impl PartRecord {
    fn pending(part_number: u32) -> Self {
        Self {
            part_number,
            part_size: 0,
            etag: None,
            part_hash: None,
            upload_time: None,
            retry_count: 0,
            uploaded: false,
            error_message: None,
            node_name: None,
        }
    }
}

/// One chunked-upload attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    pub file_name: String,
    /// Known once the session completes
    pub file_hash: Option<String>,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_parts: u32,
    pub bucket_name: String,
    pub object_name: String,
    pub metadata: HashMap<String, String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub status: SessionStatus,
    pub node_name: String,
    pub logic_node_name: String,
    /// Sorted by part number, unique
    pub uploaded_parts: Vec<PartRecord>,
    pub uploaded_size: u64,
    pub tenant_id: String,
    pub user_id: String,
    pub abort_reason: Option<String>,
}

impl UploadSession {
    pub fn part(&self, part_number: u32) -> Option<&PartRecord> {
        self.uploaded_parts
            .binary_search_by_key(&part_number, |p| p.part_number)
            .ok()
            .map(|i| &self.uploaded_parts[i])
    }

    /// Existing record for the part, or a new pending one in sorted position
    pub(crate) fn part_entry(&mut self, part_number: u32) -> &mut PartRecord {
        let index = match self
            .uploaded_parts
            .binary_search_by_key(&part_number, |p| p.part_number)
        {
            Ok(i) => i,
            Err(i) => {
                self.uploaded_parts.insert(i, PartRecord::pending(part_number));
                i
            }
        };
        &mut self.uploaded_parts[index]
    }

    /// Part numbers in [1, total_parts] without an uploaded record, sorted
    pub fn missing_parts(&self) -> Vec<u32> {
        (1..=self.total_parts)
            .filter(|n| !self.part(*n).is_some_and(|p| p.uploaded))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_parts().is_empty()
    }

    pub fn uploaded_part_count(&self) -> usize {
        self.uploaded_parts.iter().filter(|p| p.uploaded).count()
    }

    /// Fraction of declared bytes received (0.0 - 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.uploaded_size as f64 / self.total_size as f64).min(1.0)
    }

    pub(crate) fn recompute_uploaded_size(&mut self) {
        self.uploaded_size = self
            .uploaded_parts
            .iter()
            .filter(|p| p.uploaded)
            .map(|p| p.part_size)
            .sum();
    }

    pub fn owned_by(&self, tenant_id: &str, user_id: &str) -> bool {
        self.tenant_id == tenant_id && self.user_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total_size: u64, chunk_size: u64) -> UploadSession {
        let now = Utc::now();
        UploadSession {
            upload_id: "u1".to_string(),
            file_name: "a.bin".to_string(),
            file_hash: None,
            total_size,
            chunk_size,
            total_parts: total_parts(total_size, chunk_size).unwrap(),
            bucket_name: "node-a".to_string(),
            object_name: "2026/01/01/u1.bin".to_string(),
            metadata: HashMap::new(),
            create_time: now,
            update_time: now,
            status: SessionStatus::Uploading,
            node_name: "node-a".to_string(),
            logic_node_name: "logic-1".to_string(),
            uploaded_parts: Vec::new(),
            uploaded_size: 0,
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            abort_reason: None,
        }
    }

    #[test]
    fn test_total_parts() {
        assert_eq!(total_parts(15 * 1024 * 1024, 5 * 1024 * 1024), Some(3));
        assert_eq!(total_parts(15 * 1024 * 1024 + 1, 5 * 1024 * 1024), Some(4));
        assert_eq!(total_parts(1, DEFAULT_CHUNK_SIZE), Some(1));
        assert_eq!(total_parts(0, DEFAULT_CHUNK_SIZE), Some(0));
        assert_eq!(total_parts(10, 0), None);
        assert_eq!(total_parts(u32::MAX as u64, 1), Some(u32::MAX));
        assert_eq!(total_parts(u32::MAX as u64 + 2, 1), None);
    }

    #[test]
    fn test_status_transitions() {
        use SessionStatus::*;
        assert!(Initializing.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Completed));
        assert!(Uploading.can_transition_to(Aborted));
        assert!(!Completed.can_transition_to(Uploading));
        assert!(!Aborted.can_transition_to(Completed));
        assert!(!Uploading.can_transition_to(Initializing));
        assert!(Uploading.can_transition_to(Completing));
        assert!(Completing.can_transition_to(Uploading));
        assert!(Completing.can_transition_to(Completed));
        assert!(!Completing.is_terminal());
        assert!(Completed.is_terminal());
        assert!(!Uploading.is_terminal());
        assert_eq!(Aborted.to_string(), "ABORTED");
    }

    #[test]
    fn test_part_entry_keeps_order() {
        let mut s = session(100, 10);
        s.part_entry(7).uploaded = true;
        s.part_entry(2).uploaded = true;
        s.part_entry(7).retry_count += 1;

        let numbers: Vec<_> = s.uploaded_parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, [2, 7]);
        assert_eq!(s.part(7).unwrap().retry_count, 1);
    }

    #[test]
    fn test_missing_parts_and_progress() {
        let mut s = session(30, 10);
        for n in [1, 3] {
            let p = s.part_entry(n);
            p.uploaded = true;
            p.part_size = 10;
        }
        s.part_entry(2).retry_count = 2;
        s.recompute_uploaded_size();

        assert_eq!(s.missing_parts(), [2]);
        assert_eq!(s.uploaded_size, 20);
        assert_eq!(s.uploaded_part_count(), 2);
        assert!((s.progress() - 2.0 / 3.0).abs() < 1e-9);
        assert!(!s.is_complete());
    }
}
