//! Common test utilities for tenancy-service integration tests.
//!
//! `FakePool` stands in for the Postgres pool. Its connections keep their
//! session settings across release, like a real pooled connection would
//! without the release hook, so a missing rebind shows up as a stale tenant.

#![allow(dead_code)]

use async_trait::async_trait;
use service_core::config::Config as CommonConfig;
use service_core::error::AppError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tenancy_service::config::{DatabaseConfig, Environment, TenancyConfig, TenantConfig};
use tenancy_service::db::{
    ConnectionSource, Database, ScopedConnection, SessionContextBinder, DEFAULT_SESSION_VARIABLE,
};
use tenancy_service::startup::{build_state, AppState};
use tenancy_service::tenant::{TenantCache, TenantId, TenantRecord, TenantStore, TenantValidator};

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,tenancy_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn tenant(id: i64) -> TenantId {
    TenantId::new(id).expect("test tenant ids are positive")
}

/// Everything the fake pool and its connections observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Checkout(usize),
    SetConfig { conn: usize, value: String },
    Begin(usize),
    Statement {
        conn: usize,
        sql: String,
        tenant: Option<String>,
    },
    Commit(usize),
    Rollback(usize),
    Release(usize),
    Discard(usize),
}

/// One-shot failure switches. Each is consumed by the next matching call.
#[derive(Default)]
pub struct Failures {
    pub bind: AtomicBool,
    pub begin: AtomicBool,
    pub commit: AtomicBool,
    pub rollback: AtomicBool,
    pub checkout: AtomicBool,
    pub health: AtomicBool,
}

impl Failures {
    fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}

struct PoolInner {
    idle: Mutex<VecDeque<FakeConnection>>,
    events: Mutex<Vec<Event>>,
    failures: Failures,
    next_id: AtomicUsize,
}

impl PoolInner {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn open(self: &Arc<Self>) -> FakeConnection {
        FakeConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            session: HashMap::new(),
            depth: 0,
            pool: Arc::clone(self),
        }
    }
}

#[derive(Clone)]
pub struct FakePool {
    inner: Arc<PoolInner>,
}

impl FakePool {
    /// A pool of `size` physical connections, all opened up front.
    pub fn new(size: usize) -> Self {
        let inner = Arc::new(PoolInner {
            idle: Mutex::new(VecDeque::new()),
            events: Mutex::new(Vec::new()),
            failures: Failures::default(),
            next_id: AtomicUsize::new(0),
        });
        {
            let mut idle = inner.idle.lock().unwrap();
            for _ in 0..size {
                idle.push_back(inner.open());
            }
        }
        Self { inner }
    }

    pub fn failures(&self) -> &Failures {
        &self.inner.failures
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.inner.events.lock().unwrap().clear();
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    /// Session value currently held by the idle connection `id`.
    pub fn idle_session_value(&self, id: usize) -> Option<String> {
        self.inner
            .idle
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| c.session.get(DEFAULT_SESSION_VARIABLE).cloned())
    }

    /// Tenant observed by every statement, in order.
    pub fn statement_tenants(&self) -> Vec<Option<String>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Statement { tenant, .. } => Some(tenant),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ConnectionSource for FakePool {
    type Connection = FakeConnection;

    async fn checkout(&self) -> Result<FakeConnection, anyhow::Error> {
        if Failures::take(&self.inner.failures.checkout) {
            anyhow::bail!("pool timed out");
        }
        let conn = self
            .inner
            .idle
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("pool exhausted"))?;
        self.inner.record(Event::Checkout(conn.id));
        Ok(conn)
    }

    async fn release(&self, conn: FakeConnection) {
        self.inner.record(Event::Release(conn.id));
        self.inner.idle.lock().unwrap().push_back(conn);
    }

    async fn discard(&self, conn: FakeConnection) {
        self.inner.record(Event::Discard(conn.id));
        // Replace the closed connection so the pool keeps its size.
        let fresh = self.inner.open();
        self.inner.idle.lock().unwrap().push_back(fresh);
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        if Failures::take(&self.inner.failures.health) {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }
}

/// Nested `begin` calls stack like savepoints; each commit or rollback
/// closes one level.
pub struct FakeConnection {
    pub id: usize,
    session: HashMap<String, String>,
    depth: usize,
    pool: Arc<PoolInner>,
}

impl FakeConnection {
    /// Run a statement, recording the tenant it observed.
    pub async fn execute(&mut self, sql: &str) -> Result<(), AppError> {
        let tenant = self
            .session
            .get(DEFAULT_SESSION_VARIABLE)
            .filter(|v| !v.is_empty())
            .cloned();
        self.pool.record(Event::Statement {
            conn: self.id,
            sql: sql.to_string(),
            tenant,
        });
        Ok(())
    }
}

#[async_trait]
impl ScopedConnection for FakeConnection {
    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), anyhow::Error> {
        if Failures::take(&self.pool.failures.bind) {
            anyhow::bail!("server closed the connection unexpectedly");
        }
        self.session.insert(name.to_string(), value.to_string());
        self.pool.record(Event::SetConfig {
            conn: self.id,
            value: value.to_string(),
        });
        Ok(())
    }

    async fn session_variable(&mut self, name: &str) -> Result<Option<String>, anyhow::Error> {
        Ok(self.session.get(name).filter(|v| !v.is_empty()).cloned())
    }

    async fn begin(&mut self) -> Result<(), anyhow::Error> {
        if Failures::take(&self.pool.failures.begin) {
            anyhow::bail!("could not begin");
        }
        self.depth += 1;
        self.pool.record(Event::Begin(self.id));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), anyhow::Error> {
        if Failures::take(&self.pool.failures.commit) {
            anyhow::bail!("could not serialize access");
        }
        self.depth = self.depth.saturating_sub(1);
        self.pool.record(Event::Commit(self.id));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), anyhow::Error> {
        if Failures::take(&self.pool.failures.rollback) {
            anyhow::bail!("connection lost during rollback");
        }
        self.depth = self.depth.saturating_sub(1);
        self.pool.record(Event::Rollback(self.id));
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.depth > 0
    }
}

/// In-memory tenant store counting every lookup.
#[derive(Default)]
pub struct CountingTenantStore {
    records: Mutex<HashMap<i64, bool>>,
    queries: AtomicUsize,
    pub fail: AtomicBool,
}

impl CountingTenantStore {
    pub fn with_tenants(tenants: &[(i64, bool)]) -> Arc<Self> {
        let store = Self::default();
        store.records.lock().unwrap().extend(tenants.iter().copied());
        Arc::new(store)
    }

    pub fn set_active(&self, id: i64, active: bool) {
        self.records.lock().unwrap().insert(id, active);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TenantStore for CountingTenantStore {
    async fn find_tenant(&self, tenant_id: TenantId) -> Result<Option<TenantRecord>, anyhow::Error> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("tenant store unreachable");
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&tenant_id.get())
            .map(|&active| TenantRecord {
                id: tenant_id,
                active,
            }))
    }
}

pub fn test_config(environment: Environment) -> TenancyConfig {
    TenancyConfig {
        common: CommonConfig::default(),
        environment,
        service_name: "tenancy-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        tenant: TenantConfig {
            dev_fallback_tenant_id: Some(1),
            ..TenantConfig::default()
        },
    }
}

/// Application state over a fake pool and an in-memory store.
pub fn spawn_state(
    environment: Environment,
    pool: FakePool,
    store: Arc<CountingTenantStore>,
) -> AppState<FakePool> {
    init_tracing();

    let config = test_config(environment);
    let validator = TenantValidator::new(store, TenantCache::new(config.tenant.cache_ttl()));
    build_state(config, pool, validator, SessionContextBinder::default())
        .expect("Failed to build test state")
}

/// Pool against the database named by `TEST_DATABASE_URL`, migrated.
///
/// Returns `None` when the variable is unset, and the caller skips.
pub async fn test_database(max_connections: u32) -> Option<Database> {
    init_tracing();

    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let db = Database::new(
        &database_url,
        max_connections,
        0,
        SessionContextBinder::default(),
    )
    .await
    .expect("Failed to connect to TEST_DATABASE_URL");
    db.run_migrations().await.expect("Failed to run migrations");
    Some(db)
}
