//! PostgreSQL implementation of the connection seams (sqlx).

use super::{BoundConnection, ConnectionSource, ScopedConnection, SessionContextBinder};
use async_trait::async_trait;
use service_core::error::AppError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgTransactionManager};
use sqlx::{Connection, Postgres, TransactionManager};
use std::time::Duration;
use tracing::{info, instrument, warn};

#[async_trait]
impl ScopedConnection for PgConnection {
    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), anyhow::Error> {
        // is_local = false: the setting lives for the session, so it must be
        // overwritten on every checkout.
        sqlx::query("SELECT set_config($1, $2, false)")
            .bind(name)
            .bind(value)
            .execute(&mut *self)
            .await
            .map_err(|e| anyhow::anyhow!("set_config({}) failed: {}", name, e))?;
        Ok(())
    }

    async fn session_variable(&mut self, name: &str) -> Result<Option<String>, anyhow::Error> {
        let (value,): (Option<String>,) = sqlx::query_as("SELECT current_setting($1, true)")
            .bind(name)
            .fetch_one(&mut *self)
            .await
            .map_err(|e| anyhow::anyhow!("current_setting({}) failed: {}", name, e))?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    // Transaction control goes through sqlx's transaction manager so the
    // connection's depth stays accurate. A raw `BEGIN` sent through
    // `executor()` is invisible to `in_transaction`.
    async fn begin(&mut self) -> Result<(), anyhow::Error> {
        PgTransactionManager::begin(self, None).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), anyhow::Error> {
        PgTransactionManager::commit(self).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), anyhow::Error> {
        PgTransactionManager::rollback(self).await?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        Connection::is_in_transaction(self)
    }
}

#[async_trait]
impl ScopedConnection for PoolConnection<Postgres> {
    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), anyhow::Error> {
        (**self).set_session_variable(name, value).await
    }

    async fn session_variable(&mut self, name: &str) -> Result<Option<String>, anyhow::Error> {
        (**self).session_variable(name).await
    }

    async fn begin(&mut self) -> Result<(), anyhow::Error> {
        ScopedConnection::begin(&mut **self).await
    }

    async fn commit(&mut self) -> Result<(), anyhow::Error> {
        ScopedConnection::commit(&mut **self).await
    }

    async fn rollback(&mut self) -> Result<(), anyhow::Error> {
        ScopedConnection::rollback(&mut **self).await
    }

    fn in_transaction(&self) -> bool {
        ScopedConnection::in_transaction(&**self)
    }
}

impl BoundConnection<PoolConnection<Postgres>> {
    /// The bound connection as a sqlx executor.
    pub fn executor(&mut self) -> &mut PgConnection {
        &mut ***self
    }
}

/// Pool-backed connection source.
#[derive(Clone)]
pub struct PgConnectionSource {
    pool: PgPool,
}

impl PgConnectionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConnectionSource for PgConnectionSource {
    type Connection = PoolConnection<Postgres>;

    async fn checkout(&self) -> Result<Self::Connection, anyhow::Error> {
        self.pool
            .acquire()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to acquire connection: {}", e))
    }

    async fn release(&self, conn: Self::Connection) {
        // Dropping a PoolConnection returns it; the pool's after_release hook
        // then clears the tenant setting.
        drop(conn);
    }

    async fn discard(&self, conn: Self::Connection) {
        if let Err(e) = conn.close().await {
            warn!(error = %e, "Error while closing discarded connection");
        }
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Health check failed: {}", e))?;
        Ok(())
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    ///
    /// Connections released to the pool have the binder's setting cleared; a
    /// connection that cannot be cleared, or that still has a transaction
    /// open, is closed instead of reused.
    #[instrument(skip(database_url, binder), fields(service = "tenancy-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        binder: SessionContextBinder,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            session_variable = %binder.variable(),
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .after_release(move |conn, _meta| {
                let binder = binder.clone();
                Box::pin(async move {
                    if ScopedConnection::in_transaction(conn) {
                        warn!("Connection released inside a transaction, closing it");
                        return Ok(false);
                    }
                    match binder.clear(conn).await {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            warn!(error = %e, "Failed to clear tenant on release, closing connection");
                            Ok(false)
                        }
                    }
                })
            })
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_source(&self) -> PgConnectionSource {
        PgConnectionSource::new(self.pool.clone())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}
