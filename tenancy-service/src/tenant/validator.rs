//! Tenant validity check, cache first, store on miss.

use super::{TenantCache, TenantError, TenantId, TenantStore};
use crate::services::metrics::{TENANT_CACHE_LOOKUPS, TENANT_STORE_QUERIES};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Clone)]
pub struct TenantValidator {
    store: Arc<dyn TenantStore>,
    cache: TenantCache,
}

impl TenantValidator {
    pub fn new(store: Arc<dyn TenantStore>, cache: TenantCache) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &TenantCache {
        &self.cache
    }

    /// Whether `tenant_id` names an active tenant.
    ///
    /// An unknown tenant is `Ok(false)` and is cached like an inactive one. A
    /// store failure is returned as `ValidationInfrastructure` and leaves the
    /// cache untouched.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn is_active(&self, tenant_id: TenantId) -> Result<bool, TenantError> {
        if let Some(entry) = self.cache.get(tenant_id) {
            TENANT_CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
            return Ok(entry.valid);
        }
        TENANT_CACHE_LOOKUPS.with_label_values(&["miss"]).inc();

        let record = self.store.find_tenant(tenant_id).await.map_err(|e| {
            TENANT_STORE_QUERIES.with_label_values(&["error"]).inc();
            warn!(error = %e, "Tenant store lookup failed");
            TenantError::ValidationInfrastructure(e)
        })?;
        TENANT_STORE_QUERIES.with_label_values(&["ok"]).inc();

        let valid = record.map(|r| r.active).unwrap_or(false);
        self.cache.insert(tenant_id, valid);
        debug!(valid, found = record.is_some(), "Tenant validity refreshed");

        Ok(valid)
    }

    /// Drop the cached validity of one tenant, e.g. after its active flag changed.
    pub fn invalidate(&self, tenant_id: TenantId) {
        self.cache.invalidate(tenant_id);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
