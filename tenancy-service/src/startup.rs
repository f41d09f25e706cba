//! Application startup and lifecycle management.

use crate::config::TenancyConfig;
use crate::db::{
    ConnectionSource, Database, PgConnectionSource, SessionContextBinder, TenantScopedUnitOfWork,
};
use crate::middleware::{tenant_context_middleware, RequestTenantContext, TenantGate};
use crate::services::{get_metrics, init_metrics};
use crate::tenant::{PgTenantStore, TenantCache, TenantId, TenantResolver, TenantValidator};
use axum::{
    extract::{Path, State},
    http::{HeaderName, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState<S: ConnectionSource> {
    pub config: Arc<TenancyConfig>,
    pub gate: TenantGate,
    pub unit_of_work: TenantScopedUnitOfWork<S>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check<S: ConnectionSource>(State(state): State<AppState<S>>) -> impl IntoResponse {
    match state.unit_of_work.source().health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": state.config.service_name,
                    "version": state.config.service_version,
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.config.service_name,
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check<S: ConnectionSource>(State(state): State<AppState<S>>) -> StatusCode {
    match state.unit_of_work.source().health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Resolved tenant plus the binding observed on a tenant-scoped connection.
async fn tenant_context<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    tenant: RequestTenantContext,
) -> Result<Json<serde_json::Value>, AppError> {
    let binder = state.unit_of_work.binder().clone();
    let bound = state
        .unit_of_work
        .run(tenant.tenant_id, move |conn| {
            Box::pin(async move { binder.current(&mut **conn).await.map_err(AppError::from) })
        })
        .await?;

    Ok(Json(json!({
        "tenant_id": tenant.tenant_id,
        "source": tenant.source,
        "session_tenant_id": bound,
    })))
}

async fn invalidate_tenant<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(raw_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let tenant_id = TenantId::new(raw_id)
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Tenant id must be positive")))?;
    state.gate.validator().invalidate(tenant_id);
    tracing::info!(tenant_id = %tenant_id, "Tenant cache entry invalidated");
    Ok(StatusCode::NO_CONTENT)
}

async fn invalidate_all_tenants<S: ConnectionSource>(State(state): State<AppState<S>>) -> StatusCode {
    state.gate.validator().invalidate_all();
    tracing::info!("Tenant cache cleared");
    StatusCode::NO_CONTENT
}

/// Build the HTTP router. Tenant routes sit behind the admission middleware;
/// health, metrics and cache administration do not.
pub fn build_router<S: ConnectionSource>(state: AppState<S>) -> Router {
    let tenant_routes = Router::new()
        .route("/tenant/context", get(tenant_context::<S>))
        .route_layer(middleware::from_fn_with_state(
            state.gate.clone(),
            tenant_context_middleware,
        ));

    Router::new()
        .route("/health", get(health_check::<S>))
        .route("/ready", get(readiness_check::<S>))
        .route("/metrics", get(metrics_handler))
        .route("/admin/tenants/invalidate", post(invalidate_all_tenants::<S>))
        .route("/admin/tenants/:id/invalidate", post(invalidate_tenant::<S>))
        .merge(tenant_routes)
        .with_state(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    tenant_id = tracing::field::Empty,
                )
            },
        ))
        .layer(middleware::from_fn(request_id_middleware))
}

/// Assemble resolver, validator and unit of work around a connection source.
pub fn build_state<S: ConnectionSource>(
    config: TenancyConfig,
    source: S,
    validator: TenantValidator,
    binder: SessionContextBinder,
) -> Result<AppState<S>, AppError> {
    let header_name = HeaderName::from_bytes(config.tenant.header_name.as_bytes())
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid tenant header: {}", e)))?;

    let mut resolver = TenantResolver::new(header_name, config.tenant.query_param.clone());
    if let Some(fallback) = config.development_fallback() {
        tracing::warn!(
            tenant_id = %fallback,
            "Development tenant fallback enabled; requests without identity use this tenant"
        );
        resolver = resolver.with_development_fallback(fallback);
    }

    Ok(AppState {
        config: Arc::new(config),
        gate: TenantGate::new(resolver, validator),
        unit_of_work: TenantScopedUnitOfWork::new(source, binder),
    })
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState<PgConnectionSource>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: TenancyConfig) -> Result<Self, AppError> {
        init_metrics();

        let binder = SessionContextBinder::new(config.tenant.session_variable.clone())
            .map_err(AppError::ConfigError)?;

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
            binder.clone(),
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let validator = TenantValidator::new(
            Arc::new(PgTenantStore::new(db.pool().clone())),
            TenantCache::new(config.tenant.cache_ttl()),
        );

        let addr = config.common.socket_addr();
        let state = build_state(config, db.connection_source(), validator, binder)?;

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Tenancy service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        tracing::info!(
            service = "tenancy-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await
    }
}
