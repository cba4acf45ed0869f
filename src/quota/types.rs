//! Quota types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Limits and Policies
// ============================================================================

/// Default per-user storage limit: 5GB
pub const DEFAULT_USER_MAX_STORAGE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

pub const DEFAULT_USER_MAX_FILE_COUNT: u64 = 10_000;

/// Default per-tenant storage limit: 100GB
pub const DEFAULT_TENANT_MAX_STORAGE_BYTES: u64 = 100 * 1024 * 1024 * 1024;

pub const DEFAULT_TENANT_MAX_FILE_COUNT: u64 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    pub max_storage_bytes: u64,
    pub max_file_count: u64,
}

impl QuotaLimits {
    pub fn new(max_storage_bytes: u64, max_file_count: u64) -> Self {
        Self {
            max_storage_bytes,
            max_file_count,
        }
    }
}

/// Limits configured for one tenant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantQuotaPolicy {
    /// Limits for the tenant as a whole
    pub tenant: Option<QuotaLimits>,
    /// Limits for users of this tenant without an override
    pub user_default: Option<QuotaLimits>,
    pub users: HashMap<String, QuotaLimits>,
}

/// Every configured quota tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaPolicies {
    pub default_user: QuotaLimits,
    pub default_tenant: QuotaLimits,
    pub tenants: HashMap<String, TenantQuotaPolicy>,
}

impl Default for QuotaPolicies {
    fn default() -> Self {
        Self {
            default_user: QuotaLimits::new(DEFAULT_USER_MAX_STORAGE_BYTES, DEFAULT_USER_MAX_FILE_COUNT),
            default_tenant: QuotaLimits::new(
                DEFAULT_TENANT_MAX_STORAGE_BYTES,
                DEFAULT_TENANT_MAX_FILE_COUNT,
            ),
            tenants: HashMap::new(),
        }
    }
}

impl QuotaPolicies {
    /// User override, then the tenant's user default, then the global default
    pub fn resolve_user(&self, tenant_id: &str, user_id: &str) -> QuotaLimits {
        let tenant = self.tenants.get(tenant_id);
        tenant
            .and_then(|t| t.users.get(user_id).copied())
            .or_else(|| tenant.and_then(|t| t.user_default))
            .unwrap_or(self.default_user)
    }

    pub fn resolve_tenant(&self, tenant_id: &str) -> QuotaLimits {
        self.tenants
            .get(tenant_id)
            .and_then(|t| t.tenant)
            .unwrap_or(self.default_tenant)
    }
}

/// What happens when a quota is exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementMode {
    /// Log the violation and allow the write
    Shadow,
    /// Reject the write
    Enforce,
}

impl EnforcementMode {
    /// Parse a mode name; anything but `shadow` enforces
    pub fn normalize(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("shadow") {
            Self::Shadow
        } else {
            Self::Enforce
        }
    }
}

// ============================================================================
// Usage and Decisions
// ============================================================================

/// Usage counters for one scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub storage_bytes: u64,
    pub file_count: u64,
}

/// Usage counters for a user and their tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub user: QuotaUsage,
    pub tenant: QuotaUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaDimension {
    UserStorage,
    UserFileCount,
    TenantStorage,
    TenantFileCount,
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserStorage => "user storage",
            Self::UserFileCount => "user file count",
            Self::TenantStorage => "tenant storage",
            Self::TenantFileCount => "tenant file count",
        };
        f.write_str(s)
    }
}

/// Result of one quota evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub exceeded: bool,
    pub user_storage_exceeded: bool,
    pub user_file_count_exceeded: bool,
    pub tenant_storage_exceeded: bool,
    pub tenant_file_count_exceeded: bool,
    pub tenant_id: String,
    pub user_id: String,
    pub user_used_storage_bytes: u64,
    pub user_max_storage_bytes: u64,
    pub user_used_file_count: u64,
    pub user_max_file_count: u64,
    pub tenant_used_storage_bytes: u64,
    pub tenant_max_storage_bytes: u64,
    pub tenant_used_file_count: u64,
    pub tenant_max_file_count: u64,
    pub incoming_file_size_bytes: u64,
}

impl QuotaDecision {
    /// Compare usage plus one incoming file against the limits
    pub fn compute(
        tenant_id: &str,
        user_id: &str,
        usage: UsageSnapshot,
        user_limits: QuotaLimits,
        tenant_limits: QuotaLimits,
        incoming_bytes: u64,
    ) -> Self {
        let user_storage_exceeded =
            usage.user.storage_bytes.saturating_add(incoming_bytes) > user_limits.max_storage_bytes;
        let user_file_count_exceeded =
            usage.user.file_count.saturating_add(1) > user_limits.max_file_count;
        let tenant_storage_exceeded = usage.tenant.storage_bytes.saturating_add(incoming_bytes)
            > tenant_limits.max_storage_bytes;
        let tenant_file_count_exceeded =
            usage.tenant.file_count.saturating_add(1) > tenant_limits.max_file_count;

        Self {
            exceeded: user_storage_exceeded
                || user_file_count_exceeded
                || tenant_storage_exceeded
                || tenant_file_count_exceeded,
            user_storage_exceeded,
            user_file_count_exceeded,
            tenant_storage_exceeded,
            tenant_file_count_exceeded,
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            user_used_storage_bytes: usage.user.storage_bytes,
            user_max_storage_bytes: user_limits.max_storage_bytes,
            user_used_file_count: usage.user.file_count,
            user_max_file_count: user_limits.max_file_count,
            tenant_used_storage_bytes: usage.tenant.storage_bytes,
            tenant_max_storage_bytes: tenant_limits.max_storage_bytes,
            tenant_used_file_count: usage.tenant.file_count,
            tenant_max_file_count: tenant_limits.max_file_count,
            incoming_file_size_bytes: incoming_bytes,
        }
    }

    /// Dimensions over their limit
    pub fn exceeded_dimensions(&self) -> Vec<QuotaDimension> {
        [
            (self.user_storage_exceeded, QuotaDimension::UserStorage),
            (self.user_file_count_exceeded, QuotaDimension::UserFileCount),
            (self.tenant_storage_exceeded, QuotaDimension::TenantStorage),
            (self.tenant_file_count_exceeded, QuotaDimension::TenantFileCount),
        ]
        .into_iter()
        .filter_map(|(hit, dim)| hit.then_some(dim))
        .collect()
    }

    /// Human-readable list of the exceeded dimensions
    pub fn reason(&self) -> String {
        let parts: Vec<String> = self
            .exceeded_dimensions()
            .into_iter()
            .map(|dim| match dim {
                QuotaDimension::UserStorage => format!(
                    "{} limit exceeded ({} + {} > {} bytes)",
                    dim, self.user_used_storage_bytes, self.incoming_file_size_bytes, self.user_max_storage_bytes
                ),
                QuotaDimension::UserFileCount => format!(
                    "{} limit exceeded ({} + 1 > {})",
                    dim, self.user_used_file_count, self.user_max_file_count
                ),
                QuotaDimension::TenantStorage => format!(
                    "{} limit exceeded ({} + {} > {} bytes)",
                    dim, self.tenant_used_storage_bytes, self.incoming_file_size_bytes, self.tenant_max_storage_bytes
                ),
                QuotaDimension::TenantFileCount => format!(
                    "{} limit exceeded ({} + 1 > {})",
                    dim, self.tenant_used_file_count, self.tenant_max_file_count
                ),
            })
            .collect();

        if parts.is_empty() {
            "within quota".to_string()
        } else {
            parts.join("; ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_policy_resolution_order() {
        let mut policies = QuotaPolicies::default();
        policies.tenants.insert(
            "acme".to_string(),
            TenantQuotaPolicy {
                tenant: Some(QuotaLimits::new(50 * GB, 1000)),
                user_default: Some(QuotaLimits::new(2 * GB, 100)),
                users: HashMap::from([("vip".to_string(), QuotaLimits::new(20 * GB, 500))]),
            },
        );

        assert_eq!(policies.resolve_user("acme", "vip").max_storage_bytes, 20 * GB);
        assert_eq!(policies.resolve_user("acme", "alice").max_storage_bytes, 2 * GB);
        assert_eq!(
            policies.resolve_user("other", "alice").max_storage_bytes,
            DEFAULT_USER_MAX_STORAGE_BYTES
        );
        assert_eq!(policies.resolve_tenant("acme").max_file_count, 1000);
        assert_eq!(
            policies.resolve_tenant("other").max_storage_bytes,
            DEFAULT_TENANT_MAX_STORAGE_BYTES
        );
    }

    #[test]
    fn test_mode_normalize() {
        assert_eq!(EnforcementMode::normalize(" SHADOW "), EnforcementMode::Shadow);
        assert_eq!(EnforcementMode::normalize("enforce"), EnforcementMode::Enforce);
        assert_eq!(EnforcementMode::normalize("bogus"), EnforcementMode::Enforce);
    }

    #[test]
    fn test_reason_lists_each_dimension() {
        let usage = UsageSnapshot {
            user: QuotaUsage { storage_bytes: 9, file_count: 2 },
            tenant: QuotaUsage { storage_bytes: 9, file_count: 2 },
        };
        let decision = QuotaDecision::compute(
            "t",
            "u",
            usage,
            QuotaLimits::new(10, 2),
            QuotaLimits::new(100, 100),
            5,
        );

        assert_eq!(
            decision.exceeded_dimensions(),
            [QuotaDimension::UserStorage, QuotaDimension::UserFileCount]
        );
        let reason = decision.reason();
        assert!(reason.contains("user storage limit exceeded (9 + 5 > 10 bytes)"));
        assert!(reason.contains("user file count limit exceeded (2 + 1 > 2)"));
        assert!(!reason.contains("tenant"));
    }
}
