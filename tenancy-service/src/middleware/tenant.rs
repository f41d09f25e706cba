//! Tenant admission middleware for multi-tenancy support.
//!
//! Per request: resolve a candidate tenant id, validate it, and attach a
//! [`RequestTenantContext`] for downstream handlers. Any failure rejects the
//! request:
//!
//! - no identity and no fallback: 400
//! - unknown or inactive tenant: 404
//! - tenant store failure: 500
//!
//! Handlers read the tenant through the extractor and never re-derive it.

use crate::services::metrics::TENANT_REJECTIONS;
use crate::tenant::{TenantError, TenantId, TenantResolver, TenantSource, TenantValidator};
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use serde::Serialize;
use service_core::error::AppError;
use tracing::{debug, info, warn};

/// The validated tenant of the current request.
///
/// Inserted once by [`tenant_context_middleware`]; a request without it has no
/// tenant. Holds no connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestTenantContext {
    pub tenant_id: TenantId,
    pub source: TenantSource,
}

/// Resolver and validator bundled as middleware state.
#[derive(Clone)]
pub struct TenantGate {
    resolver: TenantResolver,
    validator: TenantValidator,
}

impl TenantGate {
    pub fn new(resolver: TenantResolver, validator: TenantValidator) -> Self {
        Self {
            resolver,
            validator,
        }
    }

    pub fn validator(&self) -> &TenantValidator {
        &self.validator
    }

    /// Run `Resolving -> Validating -> Bound | Rejected` for one request.
    pub async fn admit(&self, parts: &Parts) -> Result<RequestTenantContext, TenantError> {
        let resolution = self
            .resolver
            .resolve(parts)
            .ok_or(TenantError::MissingIdentity)?;

        debug!(
            tenant_id = %resolution.tenant_id,
            source = resolution.source.as_str(),
            "Tenant candidate resolved"
        );

        if !self.validator.is_active(resolution.tenant_id).await? {
            return Err(TenantError::InvalidTenant(resolution.tenant_id));
        }

        Ok(RequestTenantContext {
            tenant_id: resolution.tenant_id,
            source: resolution.source,
        })
    }
}

/// Middleware attaching [`RequestTenantContext`] to the request.
///
/// Apply with `from_fn_with_state(gate, tenant_context_middleware)` after
/// authentication, so the principal extension is already present.
pub async fn tenant_context_middleware(
    State(gate): State<TenantGate>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if request.extensions().get::<RequestTenantContext>().is_some() {
        return Ok(next.run(request).await);
    }

    let (mut parts, body) = request.into_parts();

    match gate.admit(&parts).await {
        Ok(context) => {
            tracing::Span::current().record("tenant_id", context.tenant_id.get());
            parts.extensions.insert(context);
            Ok(next.run(Request::from_parts(parts, body)).await)
        }
        Err(e) => {
            TENANT_REJECTIONS.with_label_values(&[e.kind()]).inc();
            match &e {
                TenantError::ValidationInfrastructure(_) => {
                    warn!(error = %e, "Tenant admission failed on infrastructure error")
                }
                _ => info!(reason = e.kind(), "Tenant admission rejected"),
            }
            Err(e.into())
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestTenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestTenantContext>()
            .copied()
            .ok_or_else(|| TenantError::MissingIdentity.into())
    }
}
