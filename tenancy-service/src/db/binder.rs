//! Per-checkout tenant binding.

use super::ScopedConnection;
use crate::services::metrics::TENANT_BINDINGS;
use crate::tenant::{TenantError, TenantId};
use tracing::{debug, warn};

/// Default Postgres setting the row-level security policies read.
pub const DEFAULT_SESSION_VARIABLE: &str = "app.current_company_id";

/// Issues the tenant-scoping directive on a checked-out connection.
///
/// The binder keeps no memory of which connection carries which tenant.
/// Callers bind on every checkout, including a checkout of the same physical
/// connection for the same tenant.
#[derive(Debug, Clone)]
pub struct SessionContextBinder {
    variable: String,
}

impl SessionContextBinder {
    pub fn new(variable: impl Into<String>) -> Result<Self, anyhow::Error> {
        let variable = variable.into();
        if !is_valid_session_variable(&variable) {
            anyhow::bail!(
                "Invalid session variable '{}': expected a dotted name like 'app.current_company_id'",
                variable
            );
        }
        Ok(Self { variable })
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Scope `conn` to `tenant_id`. Re-binding the same tenant is harmless.
    pub async fn bind<C: ScopedConnection>(
        &self,
        conn: &mut C,
        tenant_id: TenantId,
    ) -> Result<(), TenantError> {
        match conn
            .set_session_variable(&self.variable, &tenant_id.to_string())
            .await
        {
            Ok(()) => {
                TENANT_BINDINGS.with_label_values(&["ok"]).inc();
                debug!(tenant_id = %tenant_id, variable = %self.variable, "Tenant bound to connection");
                Ok(())
            }
            Err(e) => {
                TENANT_BINDINGS.with_label_values(&["error"]).inc();
                warn!(tenant_id = %tenant_id, error = %e, "Tenant binding failed");
                Err(TenantError::BindingFailure(e))
            }
        }
    }

    /// Tenant currently bound on `conn`, if the setting holds a tenant id.
    pub async fn current<C: ScopedConnection>(
        &self,
        conn: &mut C,
    ) -> Result<Option<TenantId>, TenantError> {
        let value = conn
            .session_variable(&self.variable)
            .await
            .map_err(TenantError::BindingFailure)?;
        Ok(value.as_deref().and_then(TenantId::parse))
    }

    /// Overwrite any binding with the empty value; RLS then matches no rows.
    pub async fn clear<C: ScopedConnection>(&self, conn: &mut C) -> Result<(), TenantError> {
        conn.set_session_variable(&self.variable, "")
            .await
            .map_err(TenantError::BindingFailure)
    }
}

impl Default for SessionContextBinder {
    fn default() -> Self {
        Self {
            variable: DEFAULT_SESSION_VARIABLE.to_string(),
        }
    }
}

/// Custom Postgres settings need a `prefix.name` form of plain identifiers.
pub fn is_valid_session_variable(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() >= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
