//! Usage accounting
//!
//! Counters are only changed after a write has actually succeeded.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::Result;

use super::types::{QuotaUsage, UsageSnapshot};

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Current counters for a user and their tenant
    async fn get_usage(&self, tenant_id: &str, user_id: &str) -> Result<UsageSnapshot>;

    /// Count one stored file
    async fn record_write(&self, tenant_id: &str, user_id: &str, bytes: u64) -> Result<()>;

    /// Uncount one deleted file
    async fn record_delete(&self, tenant_id: &str, user_id: &str, bytes: u64) -> Result<()>;
}

// ============================================================================
// Memory Store
// ============================================================================

#[derive(Default)]
pub struct InMemoryUsageStore {
    users: RwLock<HashMap<(String, String), QuotaUsage>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a user's counters
    pub fn set_usage(&self, tenant_id: &str, user_id: &str, usage: QuotaUsage) {
        self.users
            .write()
            .insert((tenant_id.to_string(), user_id.to_string()), usage);
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn get_usage(&self, tenant_id: &str, user_id: &str) -> Result<UsageSnapshot> {
        let users = self.users.read();
        let user = users
            .get(&(tenant_id.to_string(), user_id.to_string()))
            .copied()
            .unwrap_or_default();
        let tenant = users
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .fold(QuotaUsage::default(), |acc, (_, u)| QuotaUsage {
                storage_bytes: acc.storage_bytes + u.storage_bytes,
                file_count: acc.file_count + u.file_count,
            });
        Ok(UsageSnapshot { user, tenant })
    }

    async fn record_write(&self, tenant_id: &str, user_id: &str, bytes: u64) -> Result<()> {
        let mut users = self.users.write();
        let usage = users
            .entry((tenant_id.to_string(), user_id.to_string()))
            .or_default();
        usage.storage_bytes = usage.storage_bytes.saturating_add(bytes);
        usage.file_count = usage.file_count.saturating_add(1);
        Ok(())
    }

    async fn record_delete(&self, tenant_id: &str, user_id: &str, bytes: u64) -> Result<()> {
        let mut users = self.users.write();
        if let Some(usage) = users.get_mut(&(tenant_id.to_string(), user_id.to_string())) {
            usage.storage_bytes = usage.storage_bytes.saturating_sub(bytes);
            usage.file_count = usage.file_count.saturating_sub(1);
        }
        Ok(())
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

pub struct SqliteUsageStore {
    pool: SqlitePool,
}

impl SqliteUsageStore {
    /// Open (creating if missing) the usage database
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_counters (
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                storage_bytes INTEGER NOT NULL DEFAULT 0,
                file_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_usage_tenant ON usage_counters(tenant_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn get_usage(&self, tenant_id: &str, user_id: &str) -> Result<UsageSnapshot> {
        let user: Option<(i64, i64)> = sqlx::query_as(
            "SELECT storage_bytes, file_count FROM usage_counters WHERE tenant_id = ? AND user_id = ?",
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let tenant: (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(storage_bytes), 0), COALESCE(SUM(file_count), 0)
            FROM usage_counters
            WHERE tenant_id = ?
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        let (user_bytes, user_files) = user.unwrap_or((0, 0));
        Ok(UsageSnapshot {
            user: QuotaUsage {
                storage_bytes: from_i64(user_bytes),
                file_count: from_i64(user_files),
            },
            tenant: QuotaUsage {
                storage_bytes: from_i64(tenant.0),
                file_count: from_i64(tenant.1),
            },
        })
    }

    async fn record_write(&self, tenant_id: &str, user_id: &str, bytes: u64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO usage_counters (tenant_id, user_id, storage_bytes, file_count, updated_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(tenant_id, user_id) DO UPDATE SET
                storage_bytes = storage_bytes + excluded.storage_bytes,
                file_count = file_count + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(to_i64(bytes))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_delete(&self, tenant_id: &str, user_id: &str, bytes: u64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE usage_counters
            SET storage_bytes = MAX(storage_bytes - ?, 0),
                file_count = MAX(file_count - 1, 0),
                updated_at = ?
            WHERE tenant_id = ? AND user_id = ?
            "#,
        )
        .bind(to_i64(bytes))
        .bind(&now)
        .bind(tenant_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_usage_counts() {
        let store = InMemoryUsageStore::new();
        store.record_write("t1", "alice", 100).await.unwrap();
        store.record_write("t1", "alice", 50).await.unwrap();
        store.record_write("t1", "bob", 10).await.unwrap();
        store.record_write("t2", "carol", 999).await.unwrap();

        let usage = store.get_usage("t1", "alice").await.unwrap();
        assert_eq!(usage.user, QuotaUsage { storage_bytes: 150, file_count: 2 });
        assert_eq!(usage.tenant, QuotaUsage { storage_bytes: 160, file_count: 3 });

        store.record_delete("t1", "alice", 500).await.unwrap();
        let usage = store.get_usage("t1", "alice").await.unwrap();
        assert_eq!(usage.user, QuotaUsage { storage_bytes: 0, file_count: 1 });
    }

    #[tokio::test]
    async fn test_sqlite_usage_counts() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("usage.db").display());
        let store = SqliteUsageStore::connect(&url).await.unwrap();

        let empty = store.get_usage("t1", "alice").await.unwrap();
        assert_eq!(empty, UsageSnapshot::default());

        store.record_write("t1", "alice", 100).await.unwrap();
        store.record_write("t1", "alice", 50).await.unwrap();
        store.record_write("t1", "bob", 10).await.unwrap();

        let usage = store.get_usage("t1", "alice").await.unwrap();
        assert_eq!(usage.user, QuotaUsage { storage_bytes: 150, file_count: 2 });
        assert_eq!(usage.tenant, QuotaUsage { storage_bytes: 160, file_count: 3 });

        store.record_delete("t1", "bob", 20).await.unwrap();
        let usage = store.get_usage("t1", "bob").await.unwrap();
        assert_eq!(usage.user, QuotaUsage::default());
    }
}
