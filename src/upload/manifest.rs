//! Chunk hashing and the manifest anchored for a completed file

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::{logical_location, part_key};

use super::types::UploadSession;

/// SHA-256 of a chunk, lowercase hex
pub fn compute_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Lowercase and strip an optional `0x` prefix
pub fn normalize_hash(hash: &str) -> String {
    let trimmed = hash.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    stripped.to_ascii_lowercase()
}

/// File hash derived from the part hashes in part order
pub fn combined_hash<'a>(part_hashes: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for hash in part_hashes {
        hasher.update(normalize_hash(hash).as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// File hash for a session whose parts are all uploaded
pub fn session_file_hash(session: &UploadSession) -> String {
    combined_hash(
        session
            .uploaded_parts
            .iter()
            .filter(|p| p.uploaded)
            .map(|p| p.part_hash.as_deref().unwrap_or_default()),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub part_number: u32,
    pub size: u64,
    pub hash: String,
    /// Logical location, resolvable on either pair member
    pub location: String,
}

/// Ordered list of chunk locations and hashes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkManifest {
    pub file_name: String,
    pub file_hash: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub logic_node_name: String,
    pub parts: Vec<ManifestEntry>,
}

impl ChunkManifest {
    pub fn from_session(session: &UploadSession, file_hash: &str) -> Self {
        let parts = session
            .uploaded_parts
            .iter()
            .filter(|p| p.uploaded)
            .map(|p| ManifestEntry {
                part_number: p.part_number,
                size: p.part_size,
                hash: p.part_hash.clone().unwrap_or_default(),
                location: logical_location(
                    &session.logic_node_name,
                    &part_key(&session.object_name, p.part_number),
                ),
            })
            .collect();

        Self {
            file_name: session.file_name.clone(),
            file_hash: file_hash.to_string(),
            total_size: session.uploaded_size,
            chunk_size: session.chunk_size,
            logic_node_name: session.logic_node_name.clone(),
            parts,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash() {
        assert_eq!(
            compute_hash(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_normalize_hash() {
        assert_eq!(normalize_hash("0xABCdef"), "abcdef");
        assert_eq!(normalize_hash(" abc "), "abc");
        assert_eq!(normalize_hash("0Xff"), "ff");
    }

    #[test]
    fn test_combined_hash_depends_on_order_not_case() {
        let a = compute_hash(b"a");
        let b = compute_hash(b"b");

        let forward = combined_hash([a.as_str(), b.as_str()]);
        let reversed = combined_hash([b.as_str(), a.as_str()]);
        assert_ne!(forward, reversed);

        let upper = a.to_uppercase();
        assert_eq!(forward, combined_hash([upper.as_str(), b.as_str()]));
    }
}
