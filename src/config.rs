//! Configuration management for Record Vault
//!
//! Scalar settings come from the environment (a `.env` file is loaded by the
//! binary). The node topology and quota tiers are JSON documents referenced
//! by path.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::chain::ChainType;
use crate::quota::{EnforcementMode, QuotaPolicies};
use crate::topology::{LoadWeights, TopologyConfig};
use crate::upload::DEFAULT_CHUNK_SIZE;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub upload: UploadConfig,
    pub placement: LoadWeights,
    pub quota: QuotaConfig,
    pub chain: ChainConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub monitor: MonitorConfig,
    pub topology_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Recommended chunk size when the client does not choose one
    pub chunk_size: u64,
    /// Attempts per chunk across both pair members before the upload fails
    pub chunk_retry_limit: u32,
    /// Attempts per secondary replica write
    pub replica_retry_limit: u32,
    /// Initial backoff between replica attempts, doubled on every retry
    pub replica_backoff_ms: u64,
    pub node_write_timeout_secs: u64,
    /// Idle UPLOADING sessions older than this are aborted by the cleanup task
    pub session_ttl_hours: i64,
    pub cleanup_interval_secs: u64,
    /// Pass over degraded replicas, copying each from its pair member
    pub repair_interval_secs: u64,
    /// Session snapshot written on shutdown
    pub export_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    pub mode: EnforcementMode,
    pub policies: QuotaPolicies,
    pub policy_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub backend: ChainType,
    /// Contract gateway base URL (FISCO front or BSN gateway)
    pub gateway_url: String,
    /// Ethereum JSON-RPC endpoint, Besu only
    pub rpc_url: Option<String>,
    pub contract_name: String,
    pub contract_address: String,
    pub user_address: String,
    pub group_id: u32,
    /// BSN application key sent with every gateway request
    pub app_key: Option<String>,
    pub timeout_secs: u64,
    pub receipt_poll_attempts: u32,
    pub receipt_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Create missing node buckets on first write
    pub create_buckets: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL for usage counters; in-memory counters when absent
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// How often the topology file is re-read; 0 disables reloads
    pub topology_reload_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            upload: UploadConfig::default(),
            placement: LoadWeights::default(),
            quota: QuotaConfig {
                mode: EnforcementMode::Enforce,
                policies: QuotaPolicies::default(),
                policy_file: None,
            },
            chain: ChainConfig {
                backend: ChainType::Memory,
                gateway_url: "http://localhost:5002/WeBASE-Front".to_string(),
                rpc_url: None,
                contract_name: "Storage".to_string(),
                contract_address: String::new(),
                user_address: String::new(),
                group_id: 1,
                app_key: None,
                timeout_secs: 10,
                receipt_poll_attempts: 40,
                receipt_poll_interval_ms: 1000,
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                create_buckets: true,
            },
            database: DatabaseConfig { url: None },
            monitor: MonitorConfig {
                poll_interval_secs: 30,
                probe_timeout_secs: 5,
                topology_reload_secs: 60,
            },
            topology_file: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_retry_limit: 3,
            replica_retry_limit: 3,
            replica_backoff_ms: 500,
            node_write_timeout_secs: 30,
            session_ttl_hours: 24,
            cleanup_interval_secs: 3600,
            repair_interval_secs: 300,
            export_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let chain_backend = match env::var("CHAIN_BACKEND") {
            Ok(value) => ChainType::from_str(&value).map_err(|_| ConfigError::InvalidValue {
                key: "CHAIN_BACKEND",
                value,
            })?,
            Err(_) => defaults.chain.backend,
        };

        let storage_backend = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "s3" | "minio" => StorageBackend::S3,
            _ => StorageBackend::Memory,
        };

        let mut quota = defaults.quota;
        quota.mode = env::var("QUOTA_MODE")
            .map(|m| EnforcementMode::normalize(&m))
            .unwrap_or(EnforcementMode::Enforce);
        quota.policy_file = env::var("QUOTA_POLICY_FILE").ok().map(PathBuf::from);
        if let Some(path) = &quota.policy_file {
            quota.policies = load_json(path)?;
        }

        Ok(Config {
            upload: UploadConfig {
                chunk_size: env_parse("CHUNK_SIZE", defaults.upload.chunk_size)?,
                chunk_retry_limit: env_parse("CHUNK_RETRY_LIMIT", defaults.upload.chunk_retry_limit)?,
                replica_retry_limit: env_parse(
                    "REPLICA_RETRY_LIMIT",
                    defaults.upload.replica_retry_limit,
                )?,
                replica_backoff_ms: env_parse("REPLICA_BACKOFF_MS", defaults.upload.replica_backoff_ms)?,
                node_write_timeout_secs: env_parse(
                    "NODE_WRITE_TIMEOUT_SECS",
                    defaults.upload.node_write_timeout_secs,
                )?,
                session_ttl_hours: env_parse("SESSION_TTL_HOURS", defaults.upload.session_ttl_hours)?,
                cleanup_interval_secs: env_parse(
                    "SESSION_CLEANUP_INTERVAL_SECS",
                    defaults.upload.cleanup_interval_secs,
                )?,
                repair_interval_secs: env_parse(
                    "REPAIR_INTERVAL_SECS",
                    defaults.upload.repair_interval_secs,
                )?,
                export_file: env::var("SESSION_EXPORT_FILE").ok().map(PathBuf::from),
            },
            placement: LoadWeights {
                inflight: env_parse("LOAD_WEIGHT_INFLIGHT", defaults.placement.inflight)?,
                waiting: env_parse("LOAD_WEIGHT_WAITING", defaults.placement.waiting)?,
                disk: env_parse("LOAD_WEIGHT_DISK", defaults.placement.disk)?,
                ..defaults.placement
            },
            quota,
            chain: ChainConfig {
                backend: chain_backend,
                gateway_url: env::var("CHAIN_GATEWAY_URL").unwrap_or(defaults.chain.gateway_url),
                rpc_url: env::var("CHAIN_RPC_URL").ok(),
                contract_name: env::var("CHAIN_CONTRACT_NAME").unwrap_or(defaults.chain.contract_name),
                contract_address: env::var("CHAIN_CONTRACT_ADDRESS").unwrap_or_default(),
                user_address: env::var("CHAIN_USER_ADDRESS").unwrap_or_default(),
                group_id: env_parse("CHAIN_GROUP_ID", defaults.chain.group_id)?,
                app_key: env::var("CHAIN_APP_KEY").ok(),
                timeout_secs: env_parse("CHAIN_TIMEOUT_SECS", defaults.chain.timeout_secs)?,
                receipt_poll_attempts: env_parse(
                    "CHAIN_RECEIPT_POLL_ATTEMPTS",
                    defaults.chain.receipt_poll_attempts,
                )?,
                receipt_poll_interval_ms: env_parse(
                    "CHAIN_RECEIPT_POLL_INTERVAL_MS",
                    defaults.chain.receipt_poll_interval_ms,
                )?,
            },
            storage: StorageConfig {
                backend: storage_backend,
                create_buckets: env_parse("STORAGE_CREATE_BUCKETS", true)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok(),
            },
            monitor: MonitorConfig {
                poll_interval_secs: env_parse("POLL_INTERVAL_SECS", defaults.monitor.poll_interval_secs)?,
                probe_timeout_secs: env_parse("PROBE_TIMEOUT_SECS", defaults.monitor.probe_timeout_secs)?,
                topology_reload_secs: env_parse(
                    "TOPOLOGY_RELOAD_SECS",
                    defaults.monitor.topology_reload_secs,
                )?,
            },
            topology_file: env::var("TOPOLOGY_FILE").ok().map(PathBuf::from),
        })
    }

    /// Load and validate the topology document named by `topology_file`
    pub fn load_topology(&self) -> Result<TopologyConfig, ConfigError> {
        let path = self
            .topology_file
            .as_ref()
            .ok_or(ConfigError::Missing("TOPOLOGY_FILE"))?;
        TopologyConfig::load(path)
    }
}

/// Read and deserialize a JSON document
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.upload.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.upload.chunk_retry_limit, 3);
        assert_eq!(config.upload.cleanup_interval_secs, 3600);
        assert_eq!(config.upload.repair_interval_secs, 300);
        assert_eq!(config.monitor.topology_reload_secs, 60);
        assert_eq!(config.chain.backend, ChainType::Memory);
        assert_eq!(config.quota.mode, EnforcementMode::Enforce);
        assert!(config.topology_file.is_none());
    }

    #[test]
    fn test_load_topology_requires_path() {
        let config = Config::default();
        assert!(matches!(
            config.load_topology(),
            Err(ConfigError::Missing("TOPOLOGY_FILE"))
        ));
    }

    #[test]
    fn test_load_json_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let result: Result<QuotaPolicies, _> = load_json(file.path());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_quota_policies() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "tenants": {{
                    "acme": {{
                        "tenant": {{ "maxStorageBytes": 1000, "maxFileCount": 10 }},
                        "users": {{ "alice": {{ "maxStorageBytes": 100, "maxFileCount": 2 }} }}
                    }}
                }}
            }}"#
        )
        .unwrap();

        let policies: QuotaPolicies = load_json(file.path()).unwrap();
        assert_eq!(policies.resolve_user("acme", "alice").max_storage_bytes, 100);
        assert_eq!(policies.resolve_tenant("acme").max_file_count, 10);
        assert_eq!(
            policies.resolve_user("acme", "bob"),
            QuotaPolicies::default().default_user
        );
    }
}
