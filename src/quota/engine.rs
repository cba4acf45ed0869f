//! Quota Engine
//!
//! Decides whether an incoming file fits within the user's and tenant's
//! limits. Evaluation is read-only.

use std::sync::Arc;

use crate::error::{Error, Result};

use super::types::{EnforcementMode, QuotaDecision, QuotaPolicies};
use super::usage::UsageStore;

#[derive(Clone)]
pub struct QuotaEngine {
    usage: Arc<dyn UsageStore>,
    policies: Arc<QuotaPolicies>,
    mode: EnforcementMode,
}

impl QuotaEngine {
    pub fn new(usage: Arc<dyn UsageStore>, policies: QuotaPolicies, mode: EnforcementMode) -> Self {
        Self {
            usage,
            policies: Arc::new(policies),
            mode,
        }
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    pub fn usage_store(&self) -> &Arc<dyn UsageStore> {
        &self.usage
    }

    /// Evaluate all four quota dimensions for one incoming file
    pub async fn evaluate(
        &self,
        tenant_id: &str,
        user_id: &str,
        incoming_file_size_bytes: u64,
    ) -> Result<QuotaDecision> {
        let usage = self.usage.get_usage(tenant_id, user_id).await?;
        Ok(QuotaDecision::compute(
            tenant_id,
            user_id,
            usage,
            self.policies.resolve_user(tenant_id, user_id),
            self.policies.resolve_tenant(tenant_id),
            incoming_file_size_bytes,
        ))
    }

    /// Evaluate and apply the enforcement mode.
    ///
    /// In shadow mode an exceeded decision is logged and returned as Ok.
    pub async fn check(
        &self,
        tenant_id: &str,
        user_id: &str,
        incoming_file_size_bytes: u64,
    ) -> Result<QuotaDecision> {
        let decision = self.evaluate(tenant_id, user_id, incoming_file_size_bytes).await?;
        if !decision.exceeded {
            return Ok(decision);
        }

        match self.mode {
            EnforcementMode::Shadow => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    user_id = %user_id,
                    incoming = incoming_file_size_bytes,
                    reason = %decision.reason(),
                    "Quota exceeded (shadow mode, write allowed)"
                );
                Ok(decision)
            }
            EnforcementMode::Enforce => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    user_id = %user_id,
                    incoming = incoming_file_size_bytes,
                    reason = %decision.reason(),
                    "Quota exceeded, rejecting write"
                );
                Err(Error::QuotaExceeded(Box::new(decision)))
            }
        }
    }

    /// Current standing without an incoming file
    pub async fn quota_status(&self, tenant_id: &str, user_id: &str) -> Result<QuotaDecision> {
        self.evaluate(tenant_id, user_id, 0).await
    }
}
