//! Seams between the unit of work and the connection pool.

use async_trait::async_trait;

/// A checked-out physical connection that can carry a session-scoped setting
/// and run a transaction.
#[async_trait]
pub trait ScopedConnection: Send + 'static {
    /// Set a session-level configuration value on this connection.
    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), anyhow::Error>;

    /// Current value of a session-level setting, `None` when unset.
    async fn session_variable(&mut self, name: &str) -> Result<Option<String>, anyhow::Error>;

    async fn begin(&mut self) -> Result<(), anyhow::Error>;

    async fn commit(&mut self) -> Result<(), anyhow::Error>;

    async fn rollback(&mut self) -> Result<(), anyhow::Error>;

    /// Whether a transaction is open on this connection, including one the
    /// caller's work opened itself.
    fn in_transaction(&self) -> bool;
}

/// Pool of connections. Exclusive ownership of a checked-out connection is
/// the pool's guarantee, not this crate's.
#[async_trait]
pub trait ConnectionSource: Clone + Send + Sync + 'static {
    type Connection: ScopedConnection;

    async fn checkout(&self) -> Result<Self::Connection, anyhow::Error>;

    /// Hand a healthy, idle connection back for reuse.
    async fn release(&self, conn: Self::Connection);

    /// Close a connection whose session state can no longer be trusted.
    async fn discard(&self, conn: Self::Connection);

    /// Cheap liveness probe of the underlying database.
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}
