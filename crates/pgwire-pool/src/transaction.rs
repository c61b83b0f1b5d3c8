//! Transactions on a leased connection.

use std::time::Duration;

use pgwire_client::{QueryResult, TransactionStatus};

use crate::error::Result;
use crate::pool::{Lease, Pool};

/// An open transaction block holding one pooled connection.
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropped without either, the connection goes back still inside the block,
/// so the pool closes it and the server rolls the work back.
#[derive(Debug)]
pub struct Transaction {
    lease: Lease,
    timeout: Duration,
}

impl Transaction {
    /// Lease a connection and issue `BEGIN`.
    ///
    /// `timeout` applies to `BEGIN` and to every statement run in the
    /// transaction.
    pub async fn begin(pool: &Pool, timeout: Duration) -> Result<Self> {
        let mut lease = pool.acquire().await?;
        let result = lease.begin(timeout).await;
        lease.record(result.as_ref().map(|_| ()));
        if let Err(e) = result {
            lease.release();
            return Err(e.into());
        }
        tracing::debug!(pid = lease.backend_pid(), "transaction started");
        Ok(Self { lease, timeout })
    }

    /// Run `sql` inside the transaction.
    pub async fn query(&mut self, sql: &str, params: &[Option<&str>]) -> Result<QueryResult> {
        self.lease.query(sql, params, self.timeout).await
    }

    /// Run a named prepared statement inside the transaction.
    pub async fn query_prepared(
        &mut self,
        name: &str,
        sql: &str,
        params: &[Option<&str>],
    ) -> Result<QueryResult> {
        self.lease
            .query_prepared(name, sql, params, self.timeout)
            .await
    }

    /// Transaction status of the underlying session.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.lease.transaction_status()
    }

    /// Issue `COMMIT` and release the connection.
    pub async fn commit(self) -> Result<()> {
        let Self {
            mut lease,
            timeout,
        } = self;
        let result = lease.commit(timeout).await;
        lease.record(result.as_ref().map(|_| ()));
        lease.release();
        result?;
        tracing::debug!("transaction committed");
        Ok(())
    }

    /// Issue `ROLLBACK` and release the connection.
    ///
    /// A failed rollback is logged, not returned; the connection is then
    /// discarded because it is unhealthy or still inside the block.
    pub async fn rollback(self) {
        let Self {
            mut lease,
            timeout,
        } = self;
        let result = lease.rollback(timeout).await;
        lease.record(result.as_ref().map(|_| ()));
        match result {
            Ok(()) => tracing::debug!("transaction rolled back"),
            Err(e) => tracing::warn!(error = %e, "rollback failed"),
        }
        lease.release();
    }
}
