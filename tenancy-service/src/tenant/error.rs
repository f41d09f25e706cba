//! Failure taxonomy for tenant resolution, validation and connection binding.
//!
//! Every variant ends either the request or the checkout. None of them is
//! recoverable in place.

use super::TenantId;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TenantError {
    /// No tenant id on the request and no fallback permitted.
    #[error("Tenant identity is required (principal, header or query parameter)")]
    MissingIdentity,

    /// The id is well formed but names no active tenant.
    #[error("Tenant {0} not found or inactive")]
    InvalidTenant(TenantId),

    /// The tenant store could not answer. Never reported as "not found".
    #[error("Tenant validation failed: {0}")]
    ValidationInfrastructure(anyhow::Error),

    /// The scoping directive failed; the connection has been discarded.
    #[error("Failed to bind tenant context to connection: {0}")]
    BindingFailure(anyhow::Error),

    /// No connection could be checked out of the pool.
    #[error("Failed to check out database connection: {0}")]
    Checkout(anyhow::Error),
}

impl TenantError {
    /// Label used for rejection metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TenantError::MissingIdentity => "missing_identity",
            TenantError::InvalidTenant(_) => "invalid_tenant",
            TenantError::ValidationInfrastructure(_) => "validation_infrastructure",
            TenantError::BindingFailure(_) => "binding_failure",
            TenantError::Checkout(_) => "checkout",
        }
    }
}

impl From<TenantError> for AppError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::MissingIdentity => AppError::BadRequest(anyhow::anyhow!(
                "Tenant identity is required (principal, header or query parameter)"
            )),
            TenantError::InvalidTenant(id) => {
                AppError::NotFound(anyhow::anyhow!("Tenant {} not found", id))
            }
            TenantError::ValidationInfrastructure(e) => {
                AppError::InternalError(e.context("Tenant validation failed"))
            }
            TenantError::BindingFailure(e) => {
                AppError::DatabaseError(e.context("Failed to bind tenant context"))
            }
            TenantError::Checkout(e) => AppError::ServiceUnavailable(e),
        }
    }
}

impl axum::response::IntoResponse for TenantError {
    fn into_response(self) -> axum::response::Response {
        AppError::from(self).into_response()
    }
}
