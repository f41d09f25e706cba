pub mod binder;
pub mod connection;
pub mod postgres;
pub mod unit_of_work;

pub use binder::{is_valid_session_variable, SessionContextBinder, DEFAULT_SESSION_VARIABLE};
pub use connection::{ConnectionSource, ScopedConnection};
pub use postgres::{Database, PgConnectionSource};
pub use unit_of_work::{BoundConnection, TenantScopedUnitOfWork};
