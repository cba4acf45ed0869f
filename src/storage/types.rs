//! Storage types and object naming

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Unknown storage node: {0}")]
    UnknownNode(String),

    #[error("Storage node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Write to {node} timed out after {secs}s")]
    Timeout { node: String, secs: u64 },

    #[error("S3 SDK error: {0}")]
    SdkError(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Object name for an upload: `yyyy/MM/dd/{uploadId}{.ext}`
pub fn object_name(upload_id: &str, file_name: &str, at: DateTime<Utc>) -> String {
    let ext = file_name
        .rsplit_once('.')
        .map(|(stem, ext)| (stem, ext.trim()))
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty() && ext.len() <= 16)
        .map(|(_, ext)| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("{}/{}{}", at.format("%Y/%m/%d"), upload_id, ext)
}

/// Key of one part object within a node bucket
pub fn part_key(object_name: &str, part_number: u32) -> String {
    format!("{}/part-{:05}", object_name, part_number)
}

/// Location that resolves on either member of the logical pair
pub fn logical_location(logic_node: &str, key: &str) -> String {
    format!("node/{}/{}", logic_node, key)
}

/// Split a logical location into (logical node, key)
pub fn parse_logical_location(location: &str) -> Option<(&str, &str)> {
    let rest = location.strip_prefix("node/")?;
    let (logic, key) = rest.split_once('/')?;
    if logic.is_empty() || key.is_empty() {
        return None;
    }
    Some((logic, key))
}

/// Result of a stored part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub node: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_object_name() {
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(object_name("abc", "Report.PDF", at), "2026/03/07/abc.pdf");
        assert_eq!(object_name("abc", "archive.tar.gz", at), "2026/03/07/abc.gz");
        assert_eq!(object_name("abc", "README", at), "2026/03/07/abc");
        assert_eq!(object_name("abc", ".bashrc", at), "2026/03/07/abc");
    }

    #[test]
    fn test_part_key_and_location() {
        let key = part_key("2026/03/07/abc.pdf", 12);
        assert_eq!(key, "2026/03/07/abc.pdf/part-00012");

        let location = logical_location("logic-1", &key);
        assert_eq!(location, "node/logic-1/2026/03/07/abc.pdf/part-00012");
        assert_eq!(
            parse_logical_location(&location),
            Some(("logic-1", key.as_str()))
        );
        assert_eq!(parse_logical_location("minio/logic-1/x"), None);
        assert_eq!(parse_logical_location("node/logic-1"), None);
    }
}
