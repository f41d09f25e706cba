//! Candidate tenant id derivation from an inbound request.
//!
//! Precedence, first present wins:
//! 1. the authenticated principal's tenant (set by the auth layer)
//! 2. the tenant header
//! 3. the tenant query parameter
//! 4. development mode only: a fixed fallback id
//!
//! Only presence is considered here. Validity is the validator's job, so an
//! inactive principal tenant still shadows a valid header.

use super::TenantId;
use axum::http::{request::Parts, HeaderMap, HeaderName};
use serde::Serialize;

/// Identity established by the authentication layer, stored as a request
/// extension before tenant resolution runs.
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal {
    pub subject: String,
    pub tenant_id: Option<TenantId>,
}

/// Where a resolved tenant id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantSource {
    Principal,
    Header,
    QueryParameter,
    DevelopmentFallback,
}

impl TenantSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantSource::Principal => "principal",
            TenantSource::Header => "header",
            TenantSource::QueryParameter => "query_parameter",
            TenantSource::DevelopmentFallback => "development_fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub tenant_id: TenantId,
    pub source: TenantSource,
}

#[derive(Debug, Clone)]
pub struct TenantResolver {
    header_name: HeaderName,
    query_param: String,
    development_fallback: Option<TenantId>,
}

impl TenantResolver {
    pub fn new(header_name: HeaderName, query_param: impl Into<String>) -> Self {
        Self {
            header_name,
            query_param: query_param.into(),
            development_fallback: None,
        }
    }

    /// Permit a fixed tenant when nothing else resolves.
    ///
    /// Only wired up when the service runs with `ENVIRONMENT=dev`; production
    /// builds of the resolver never carry a fallback.
    pub fn with_development_fallback(mut self, tenant_id: TenantId) -> Self {
        self.development_fallback = Some(tenant_id);
        self
    }

    pub fn development_fallback(&self) -> Option<TenantId> {
        self.development_fallback
    }

    pub fn resolve(&self, parts: &Parts) -> Option<Resolution> {
        self.resolve_from(
            parts.extensions.get::<AuthenticatedPrincipal>(),
            &parts.headers,
            parts.uri.query(),
        )
    }

    pub fn resolve_from(
        &self,
        principal: Option<&AuthenticatedPrincipal>,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Option<Resolution> {
        let found = |tenant_id, source| Some(Resolution { tenant_id, source });

        if let Some(id) = principal.and_then(|p| p.tenant_id) {
            return found(id, TenantSource::Principal);
        }

        if let Some(id) = headers
            .get(&self.header_name)
            .and_then(|v| v.to_str().ok())
            .and_then(TenantId::parse)
        {
            return found(id, TenantSource::Header);
        }

        if let Some(id) = query.and_then(|q| self.query_value(q)) {
            return found(id, TenantSource::QueryParameter);
        }

        match self.development_fallback {
            Some(id) => {
                tracing::warn!(
                    tenant_id = %id,
                    "No tenant identity on request, using development fallback tenant"
                );
                found(id, TenantSource::DevelopmentFallback)
            }
            None => None,
        }
    }

    fn query_value(&self, query: &str) -> Option<TenantId> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
        pairs
            .into_iter()
            .find(|(key, _)| key == &self.query_param)
            .and_then(|(_, value)| TenantId::parse(&value))
    }
}
