//! Tenant-scoped unit of work over a single connection checkout.
//!
//! Every call checks out a connection, binds the tenant, runs the caller's
//! work and hands the connection back in a known state:
//!
//! - success: commit (if transactional), then release
//! - work error: rollback (if transactional), then release
//! - binding, begin, commit or rollback failure: discard
//! - a transaction still open when the work is done: discard
//! - future dropped mid-flight: the remaining cleanup runs on the runtime
//!   before the connection re-enters the pool

use super::{ConnectionSource, ScopedConnection, SessionContextBinder};
use crate::services::metrics::{CONNECTIONS_DISCARDED, UNIT_OF_WORK_DURATION};
use crate::tenant::{TenantError, TenantId};
use futures::future::BoxFuture;
use service_core::error::AppError;
use std::ops::{Deref, DerefMut};
use std::time::Instant;
use tracing::{error, instrument, warn};

/// A connection that has been scoped to `tenant_id` for the current checkout.
///
/// Only the unit of work constructs this type, and only after the binder
/// succeeded, so holding one means the binding happened.
pub struct BoundConnection<C> {
    conn: C,
    tenant_id: TenantId,
}

impl<C> BoundConnection<C> {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl<C> Deref for BoundConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for BoundConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Single,
    Transaction,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Single => "single",
            Mode::Transaction => "transaction",
        }
    }
}

#[derive(Clone)]
pub struct TenantScopedUnitOfWork<S: ConnectionSource> {
    source: S,
    binder: SessionContextBinder,
}

impl<S: ConnectionSource> TenantScopedUnitOfWork<S> {
    pub fn new(source: S, binder: SessionContextBinder) -> Self {
        Self { source, binder }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn binder(&self) -> &SessionContextBinder {
        &self.binder
    }

    /// Run `work` on a freshly bound connection, statements autocommitted.
    pub async fn run<T, F>(&self, tenant_id: TenantId, work: F) -> Result<T, AppError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut BoundConnection<S::Connection>) -> BoxFuture<'c, Result<T, AppError>>
            + Send,
    {
        self.execute(tenant_id, Mode::Single, work).await
    }

    /// Run `work` inside one transaction on a freshly bound connection.
    ///
    /// The binding is session-level and issued before `BEGIN`, so it covers
    /// every statement of the transaction.
    pub async fn run_in_transaction<T, F>(&self, tenant_id: TenantId, work: F) -> Result<T, AppError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut BoundConnection<S::Connection>) -> BoxFuture<'c, Result<T, AppError>>
            + Send,
    {
        self.execute(tenant_id, Mode::Transaction, work).await
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, mode = mode.as_str()))]
    async fn execute<T, F>(&self, tenant_id: TenantId, mode: Mode, work: F) -> Result<T, AppError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut BoundConnection<S::Connection>) -> BoxFuture<'c, Result<T, AppError>>
            + Send,
    {
        let start = Instant::now();

        let conn = self
            .source
            .checkout()
            .await
            .map_err(TenantError::Checkout)?;
        let mut checkout = Checkout::new(self.source.clone(), conn);

        // Mandatory on every checkout, whatever the connection did before.
        checkout.bind(&self.binder, tenant_id).await?;

        if mode == Mode::Transaction {
            checkout.begin().await?;
        }

        let result = match checkout.bound_mut() {
            Some(bound) => work(bound).await,
            None => Err(AppError::InternalError(anyhow::anyhow!(
                "Connection lost before tenant work started"
            ))),
        };

        let result = checkout.finish(result).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        UNIT_OF_WORK_DURATION
            .with_label_values(&[mode.as_str(), status])
            .observe(start.elapsed().as_secs_f64());

        result
    }
}

enum Slot<C> {
    Unbound(C),
    Bound(BoundConnection<C>),
    Returned,
}

/// Owns the checked-out connection until it is released or discarded. If it
/// is dropped while still holding one, cleanup is finished on the runtime.
struct Checkout<S: ConnectionSource> {
    source: S,
    slot: Slot<S::Connection>,
    in_transaction: bool,
}

impl<S: ConnectionSource> Checkout<S> {
    fn new(source: S, conn: S::Connection) -> Self {
        Self {
            source,
            slot: Slot::Unbound(conn),
            in_transaction: false,
        }
    }

    async fn bind(
        &mut self,
        binder: &SessionContextBinder,
        tenant_id: TenantId,
    ) -> Result<(), TenantError> {
        let Slot::Unbound(conn) = &mut self.slot else {
            return Err(TenantError::BindingFailure(anyhow::anyhow!(
                "Connection is not in an unbound state"
            )));
        };

        if let Err(e) = binder.bind(conn, tenant_id).await {
            self.discard("binding").await;
            return Err(e);
        }

        if let Slot::Unbound(conn) = std::mem::replace(&mut self.slot, Slot::Returned) {
            self.slot = Slot::Bound(BoundConnection { conn, tenant_id });
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), AppError> {
        let Some(bound) = self.bound_mut() else {
            return Err(AppError::InternalError(anyhow::anyhow!(
                "Cannot begin a transaction on an unbound connection"
            )));
        };

        match bound.begin().await {
            Ok(()) => {
                self.in_transaction = true;
                Ok(())
            }
            Err(e) => {
                self.discard("begin").await;
                Err(AppError::DatabaseError(
                    e.context("Failed to begin transaction"),
                ))
            }
        }
    }

    fn bound_mut(&mut self) -> Option<&mut BoundConnection<S::Connection>> {
        match &mut self.slot {
            Slot::Bound(bound) => Some(bound),
            _ => None,
        }
    }

    async fn finish<T>(&mut self, result: Result<T, AppError>) -> Result<T, AppError> {
        let result = if self.in_transaction {
            self.complete_transaction(result).await
        } else {
            result
        };

        // Work may open or nest a transaction of its own; such a connection
        // never goes back to the pool.
        if self.connection_in_transaction() {
            error!("Unit of work left a transaction open, discarding connection");
            self.discard("open_transaction").await;
            return result.and_then(|_| {
                Err(AppError::InternalError(anyhow::anyhow!(
                    "Unit of work left a transaction open"
                )))
            });
        }

        self.release().await;
        result
    }

    async fn complete_transaction<T>(&mut self, result: Result<T, AppError>) -> Result<T, AppError> {
        match result {
            Ok(value) => {
                let committed = match self.bound_mut() {
                    Some(bound) => bound.commit().await,
                    None => Err(anyhow::anyhow!("Connection lost before commit")),
                };
                match committed {
                    Ok(()) => {
                        self.in_transaction = false;
                        Ok(value)
                    }
                    Err(e) => {
                        self.discard("commit").await;
                        Err(AppError::DatabaseError(
                            e.context("Failed to commit transaction"),
                        ))
                    }
                }
            }
            Err(work_err) => {
                let rolled_back = match self.bound_mut() {
                    Some(bound) => bound.rollback().await,
                    None => Err(anyhow::anyhow!("Connection lost before rollback")),
                };
                match rolled_back {
                    Ok(()) => self.in_transaction = false,
                    Err(e) => {
                        error!(error = %e, "Rollback failed, discarding connection");
                        self.discard("rollback").await;
                    }
                }
                Err(work_err)
            }
        }
    }

    fn connection_in_transaction(&self) -> bool {
        match &self.slot {
            Slot::Bound(bound) => bound.in_transaction(),
            Slot::Unbound(conn) => conn.in_transaction(),
            Slot::Returned => false,
        }
    }

    fn take(&mut self) -> Option<S::Connection> {
        match std::mem::replace(&mut self.slot, Slot::Returned) {
            Slot::Unbound(conn) => Some(conn),
            Slot::Bound(bound) => Some(bound.conn),
            Slot::Returned => None,
        }
    }

    async fn release(&mut self) {
        if let Some(conn) = self.take() {
            self.source.release(conn).await;
        }
    }

    async fn discard(&mut self, reason: &'static str) {
        if let Some(conn) = self.take() {
            CONNECTIONS_DISCARDED.with_label_values(&[reason]).inc();
            self.source.discard(conn).await;
        }
    }
}

impl<S: ConnectionSource> Drop for Checkout<S> {
    fn drop(&mut self) {
        let in_transaction = self.in_transaction;
        let Some(conn) = self.take() else {
            return;
        };
        let source = self.source.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(abort_checkout(source, conn, in_transaction));
            }
            Err(_) => {
                CONNECTIONS_DISCARDED.with_label_values(&["cancelled"]).inc();
                warn!("Unit of work dropped outside a runtime, closing connection");
                drop(conn);
            }
        }
    }
}

/// Cleanup for a cancelled unit of work.
///
/// An open transaction is rolled back before the connection goes back to the
/// pool. Anything else (binding in flight, autocommit statement possibly still
/// running) cannot be confirmed idle, so the connection is discarded.
async fn abort_checkout<S: ConnectionSource>(source: S, mut conn: S::Connection, in_transaction: bool) {
    if in_transaction || conn.in_transaction() {
        match conn.rollback().await {
            Ok(()) if !conn.in_transaction() => {
                warn!("Unit of work cancelled, transaction rolled back");
                source.release(conn).await;
                return;
            }
            Ok(()) => {
                error!("Transaction still open after rollback on cancellation");
            }
            Err(e) => {
                error!(error = %e, "Rollback after cancellation failed");
            }
        }
    } else {
        warn!("Unit of work cancelled outside a transaction, discarding connection");
    }

    CONNECTIONS_DISCARDED.with_label_values(&["cancelled"]).inc();
    source.discard(conn).await;
}
