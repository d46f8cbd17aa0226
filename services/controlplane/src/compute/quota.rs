//! Instance quota lookup.
use async_trait::async_trait;
use std::collections::HashMap;

/// Source of per-tenant instance limits.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    /// Maximum number of active instances of `instance_type` the tenant may
    /// hold.
    async fn allowed_quota(&self, tenant_id: &str, instance_type: &str) -> anyhow::Result<i64>;
}

/// Limits read from configuration. The same limits apply to every tenant.
#[derive(Debug, Clone, Default)]
pub struct StaticQuota {
    default_limit: i64,
    per_instance_type: HashMap<String, i64>,
}

impl StaticQuota {
    pub fn new(default_limit: i64, per_instance_type: HashMap<String, i64>) -> Self {
        Self {
            default_limit,
            per_instance_type,
        }
    }
}

#[async_trait]
impl QuotaProvider for StaticQuota {
    async fn allowed_quota(&self, _tenant_id: &str, instance_type: &str) -> anyhow::Result<i64> {
        Ok(self
            .per_instance_type
            .get(instance_type)
            .copied()
            .unwrap_or(self.default_limit))
    }
}
