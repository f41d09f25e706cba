mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::from_fn_with_state,
    routing::get,
    Extension, Router,
};
use common::{spawn_state, tenant, CountingTenantStore, Event, FakePool};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::atomic::Ordering;
use tenancy_service::config::Environment;
use tenancy_service::middleware::{tenant_context_middleware, RequestTenantContext};
use tenancy_service::services::init_metrics;
use tenancy_service::startup::build_router;
use tenancy_service::tenant::AuthenticatedPrincipal;
use tower::util::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get_context(header: Option<&str>, query: Option<&str>) -> Request<Body> {
    let uri = match query {
        Some(q) => format!("/tenant/context?{}", q),
        None => "/tenant/context".to_string(),
    };
    let mut builder = Request::builder().uri(uri);
    if let Some(value) = header {
        builder = builder.header("x-company-id", value);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_header_tenant_is_bound_on_connection() {
    let pool = FakePool::new(1);
    let store = CountingTenantStore::with_tenants(&[(7, true)]);
    let app = build_router(spawn_state(Environment::Prod, pool.clone(), store));

    let response = app.oneshot(get_context(Some("7"), None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tenant_id"], 7);
    assert_eq!(body["source"], "header");
    assert_eq!(body["session_tenant_id"], 7);
    assert!(pool
        .events()
        .contains(&Event::SetConfig { conn: 0, value: "7".to_string() }));
}

#[tokio::test]
async fn test_query_parameter_resolves_tenant() {
    let pool = FakePool::new(1);
    let store = CountingTenantStore::with_tenants(&[(12, true)]);
    let app = build_router(spawn_state(Environment::Prod, pool, store));

    let response = app
        .oneshot(get_context(None, Some("page=2&company_id=12")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tenant_id"], 12);
    assert_eq!(body["source"], "query_parameter");
}

#[tokio::test]
async fn test_inactive_tenant_is_404_without_database_work() {
    let pool = FakePool::new(1);
    let store = CountingTenantStore::with_tenants(&[(42, false)]);
    let app = build_router(spawn_state(Environment::Prod, pool.clone(), store));

    let response = app.oneshot(get_context(Some("42"), None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(pool.events().is_empty(), "rejected request must not check out a connection");
}

#[tokio::test]
async fn test_unknown_tenant_is_404() {
    let pool = FakePool::new(1);
    let store = CountingTenantStore::with_tenants(&[]);
    let app = build_router(spawn_state(Environment::Prod, pool, store));

    let response = app.oneshot(get_context(Some("999"), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_store_failure_is_500_and_retried() {
    let pool = FakePool::new(1);
    let store = CountingTenantStore::with_tenants(&[(9, true)]);
    store.fail.store(true, Ordering::SeqCst);
    let app = build_router(spawn_state(Environment::Prod, pool.clone(), store.clone()));

    let response = app
        .clone()
        .oneshot(get_context(Some("9"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(
        !body["error"].as_str().unwrap_or_default().contains("unreachable"),
        "store internals must not leak"
    );
    assert!(pool.events().is_empty());

    store.fail.store(false, Ordering::SeqCst);
    let response = app.oneshot(get_context(Some("9"), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.queries(), 2);
}

#[tokio::test]
async fn test_malformed_identity_is_400_in_production() {
    let pool = FakePool::new(1);
    let store = CountingTenantStore::with_tenants(&[(1, true)]);
    let app = build_router(spawn_state(Environment::Prod, pool.clone(), store.clone()));

    for header in ["abc", "0", "-3"] {
        let response = app
            .clone()
            .oneshot(get_context(Some(header), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "header {:?}", header);
    }

    let response = app.oneshot(get_context(None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(store.queries(), 0);
    assert!(pool.events().is_empty());
}

#[tokio::test]
async fn test_development_fallback_only_in_dev() {
    let store = CountingTenantStore::with_tenants(&[(1, true)]);

    let dev = build_router(spawn_state(Environment::Dev, FakePool::new(1), store.clone()));
    let response = dev.oneshot(get_context(None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tenant_id"], 1);
    assert_eq!(body["source"], "development_fallback");

    let prod = build_router(spawn_state(Environment::Prod, FakePool::new(1), store));
    let response = prod.oneshot(get_context(None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_principal_tenant_beats_header() {
    let store = CountingTenantStore::with_tenants(&[(3, true), (5, true)]);
    let state = spawn_state(Environment::Prod, FakePool::new(1), store);

    let principal = AuthenticatedPrincipal {
        subject: "user-17".to_string(),
        tenant_id: Some(tenant(3)),
    };

    let app = Router::new()
        .route(
            "/whoami",
            get(|ctx: RequestTenantContext| async move { ctx.tenant_id.to_string() }),
        )
        .layer(from_fn_with_state(state.gate.clone(), tenant_context_middleware))
        .layer(Extension(principal));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("x-company-id", "5")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"3");
}

#[tokio::test]
async fn test_extractor_without_middleware_is_400() {
    let app = Router::new().route(
        "/whoami",
        get(|ctx: RequestTenantContext| async move { ctx.tenant_id.to_string() }),
    );

    let response = app
        .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_invalidation_forces_revalidation() {
    let pool = FakePool::new(1);
    let store = CountingTenantStore::with_tenants(&[(7, true)]);
    let app = build_router(spawn_state(Environment::Prod, pool, store.clone()));

    let response = app
        .clone()
        .oneshot(get_context(Some("7"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    store.set_active(7, false);
    let response = app
        .clone()
        .oneshot(get_context(Some("7"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK, "cached validity still trusted");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/tenants/7/invalidate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(get_context(Some("7"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/tenants/0/invalidate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.queries(), 2);
}

#[tokio::test]
async fn test_admin_invalidate_all() {
    let store = CountingTenantStore::with_tenants(&[(7, true)]);
    let state = spawn_state(Environment::Prod, FakePool::new(1), store);
    state
        .gate
        .validator()
        .cache()
        .insert(tenant(7), true);
    let app = build_router(state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/tenants/invalidate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(state.gate.validator().cache().is_empty());
}

#[tokio::test]
async fn test_health_reflects_pool() {
    let pool = FakePool::new(1);
    let store = CountingTenantStore::with_tenants(&[]);
    let app = build_router(spawn_state(Environment::Prod, pool.clone(), store));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");

    pool.failures().health.store(true, Ordering::SeqCst);
    let response = app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_http_request_metrics_are_exported() {
    init_metrics();
    let store = CountingTenantStore::with_tenants(&[(7, true)]);
    let app = build_router(spawn_state(Environment::Prod, FakePool::new(1), store));

    let response = app
        .clone()
        .oneshot(get_context(Some("7"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("http_requests_total"), "{}", body);
    assert!(body.contains("path=\"/tenant/context\""), "{}", body);
    assert!(body.contains("tenancy_bindings_total"), "{}", body);
}
