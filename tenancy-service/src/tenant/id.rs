//! Tenant identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a tenant (company). Always strictly positive.
///
/// A `TenantId` only says the value is well formed. Whether the tenant exists
/// and is active is decided by [`TenantValidator`](super::TenantValidator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct TenantId(i64);

impl TenantId {
    /// Returns `None` for zero or negative values.
    pub fn new(value: i64) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    /// Parse a header or query value. Anything that is not a positive integer
    /// yields `None` rather than an error.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse::<i64>().ok().and_then(Self::new)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for TenantId {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("tenant id must be positive, got {}", value))
    }
}

impl From<TenantId> for i64 {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// Tenant row as seen by this subsystem. Other attributes belong to business logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantRecord {
    pub id: TenantId,
    pub active: bool,
}
