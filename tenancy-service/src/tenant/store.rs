//! Tenant store: the authoritative `{id, active}` lookup behind the cache.

use super::{TenantId, TenantRecord};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::instrument;

#[async_trait]
pub trait TenantStore: Send + Sync {
    /// `Ok(None)` when the tenant does not exist; `Err` only for
    /// infrastructure failures.
    async fn find_tenant(&self, tenant_id: TenantId) -> Result<Option<TenantRecord>, anyhow::Error>;
}

/// Reads tenants from the `companies` table.
///
/// The lookup runs on an unscoped connection: the companies table itself is
/// not tenant-partitioned.
#[derive(Clone)]
pub struct PgTenantStore {
    pool: PgPool,
}

impl PgTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantStore for PgTenantStore {
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    async fn find_tenant(&self, tenant_id: TenantId) -> Result<Option<TenantRecord>, anyhow::Error> {
        let row: Option<(i64, bool)> =
            sqlx::query_as("SELECT id, active FROM companies WHERE id = $1")
                .bind(tenant_id.get())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to look up tenant {}: {}", tenant_id, e))?;

        row.map(|(id, active)| {
            let id = TenantId::new(id)
                .ok_or_else(|| anyhow::anyhow!("companies row has non-positive id {}", id))?;
            Ok(TenantRecord { id, active })
        })
        .transpose()
    }
}
