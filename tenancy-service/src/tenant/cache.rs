//! TTL-bounded cache of tenant validity.

use super::TenantId;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Five minutes, the default trust window for a validity observation.
pub const DEFAULT_TENANT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub tenant_id: TenantId,
    pub valid: bool,
    pub observed_at: Instant,
}

/// Shared, read-mostly map from tenant id to its last observed validity.
///
/// Entries are replaced wholesale on revalidation (last write wins) and an
/// entry at or past the TTL is never returned.
#[derive(Debug, Clone)]
pub struct TenantCache {
    entries: Arc<DashMap<TenantId, CacheEntry>>,
    ttl: Duration,
}

impl TenantCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh entry for `tenant_id`, if any.
    pub fn get(&self, tenant_id: TenantId) -> Option<CacheEntry> {
        let entry = *self.entries.get(&tenant_id)?;
        if entry.observed_at.elapsed() < self.ttl {
            Some(entry)
        } else {
            None
        }
    }

    pub fn insert(&self, tenant_id: TenantId, valid: bool) -> CacheEntry {
        let entry = CacheEntry {
            tenant_id,
            valid,
            observed_at: Instant::now(),
        };
        self.entries.insert(tenant_id, entry);
        entry
    }

    pub fn invalidate(&self, tenant_id: TenantId) {
        self.entries.remove(&tenant_id);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TenantCache {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT_CACHE_TTL)
    }
}
