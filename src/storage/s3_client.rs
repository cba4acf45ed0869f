//! S3-compatible client for one storage node
//!
//! Each physical node is its own MinIO deployment; the node name doubles as
//! the bucket that holds its parts.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};

use crate::topology::PhysicalNodeConfig;

use super::types::StorageError;

#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
    config: PhysicalNodeConfig,
}

impl S3Client {
    /// Build a client for a node. No request is sent.
    pub fn new(node: &PhysicalNodeConfig) -> Self {
        let credentials = Credentials::new(
            &node.access_key,
            &node.secret_key,
            None,
            None,
            "record-vault",
        );

        let region = node
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&node.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: node.name.clone(),
            config: node.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Configuration the client was built from
    pub fn node_config(&self) -> &PhysicalNodeConfig {
        &self.config
    }

    pub async fn bucket_exists(&self) -> Result<bool, StorageError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string();
                if message.contains("404") || message.contains("NotFound") {
                    Ok(false)
                } else {
                    Err(StorageError::ConnectionFailed(format!(
                        "Failed to check bucket {}: {}",
                        self.bucket, message
                    )))
                }
            }
        }
    }

    /// Create the bucket if it does not exist yet
    pub async fn ensure_bucket(&self) -> Result<(), StorageError> {
        if self.bucket_exists().await? {
            return Ok(());
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                tracing::info!(bucket = %self.bucket, "Created bucket");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                // Another writer may have won the race
                if message.contains("BucketAlreadyOwnedByYou") || message.contains("BucketAlreadyExists") {
                    Ok(())
                } else {
                    Err(StorageError::SdkError(format!(
                        "Failed to create bucket {}: {}",
                        self.bucket, message
                    )))
                }
            }
        }
    }

    /// Upload an object, returning its ETag
    pub async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                StorageError::SdkError(format!("Failed to put object {}: {}", key, e))
            })?;

        Ok(response
            .e_tag()
            .map(|s| s.trim_matches('"').to_string())
            .unwrap_or_default())
    }

    /// Download an object's body
    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("404") || message.contains("NoSuchKey") {
                    StorageError::ObjectNotFound(key.to_string())
                } else {
                    StorageError::SdkError(format!("Failed to get object {}: {}", key, message))
                }
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::SdkError(format!("Failed to read object body: {}", e)))?;
        Ok(body.into_bytes().to_vec())
    }

    pub async fn object_exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string();
                if message.contains("404") || message.contains("NotFound") || message.contains("NoSuchKey") {
                    Ok(false)
                } else {
                    Err(StorageError::SdkError(format!(
                        "Failed to head object {}: {}",
                        key, message
                    )))
                }
            }
        }
    }
}
