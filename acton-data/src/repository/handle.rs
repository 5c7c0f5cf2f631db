//! Execution target of a repository: a pool or an open transaction

use std::sync::Arc;

use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Transaction};
use tokio::sync::Mutex;

use super::filter::Value;
use crate::classifier::Classify;
use crate::error::{DatabaseError, DbResult, ErrorKind};
use crate::manager::PoolHandle;

/// Where repository statements run
#[derive(Debug, Clone)]
pub enum DbHandle {
    /// Each statement acquires a connection from the pool
    Pool(AnyPool),
    /// Statements share one open transaction
    Transaction(TxHandle),
}

impl From<AnyPool> for DbHandle {
    fn from(pool: AnyPool) -> Self {
        Self::Pool(pool)
    }
}

impl From<PoolHandle> for DbHandle {
    fn from(handle: PoolHandle) -> Self {
        Self::Pool(handle.into())
    }
}

impl From<&PoolHandle> for DbHandle {
    fn from(handle: &PoolHandle) -> Self {
        Self::Pool(handle.pool().clone())
    }
}

/// Shared, finish-once transaction
///
/// Clones refer to the same transaction. After commit or rollback every
/// statement fails with a `Query` error.
#[derive(Clone)]
pub struct TxHandle {
    inner: Arc<Mutex<Option<Transaction<'static, Any>>>>,
}

impl std::fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle")
            .field("shared", &Arc::strong_count(&self.inner))
            .finish_non_exhaustive()
    }
}

impl TxHandle {
    fn new(tx: Transaction<'static, Any>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub async fn commit(&self) -> DbResult<()> {
        let tx = self.take("commit").await?;
        tx.commit().await.map_err(|e| e.classify("commit"))
    }

    pub async fn rollback(&self) -> DbResult<()> {
        let tx = self.take("rollback").await?;
        tx.rollback().await.map_err(|e| e.classify("rollback"))
    }

    async fn take(&self, operation: &str) -> DbResult<Transaction<'static, Any>> {
        self.inner
            .lock()
            .await
            .take()
            .ok_or_else(|| finished(operation))
    }
}

fn finished(operation: &str) -> DatabaseError {
    DatabaseError::new(ErrorKind::Query, operation, "transaction already finished")
}

impl DbHandle {
    pub fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    /// Begin a transaction on a pool
    ///
    /// On an open transaction this returns the same transaction, so nested
    /// scopes join the outer one.
    pub(crate) async fn begin(&self) -> DbResult<(TxHandle, bool)> {
        match self {
            Self::Pool(pool) => {
                let tx = pool.begin().await.map_err(|e| e.classify("begin"))?;
                Ok((TxHandle::new(tx), true))
            }
            Self::Transaction(tx) => Ok((tx.clone(), false)),
        }
    }

    /// Run a statement, returning the number of affected rows
    pub(crate) async fn execute(&self, operation: &str, sql: &str, params: &[Value]) -> DbResult<u64> {
        let query = bind_all(sqlx::query(sql), params);
        let result = match self {
            Self::Pool(pool) => query.execute(pool).await,
            Self::Transaction(tx) => {
                let mut guard = tx.inner.lock().await;
                let conn = guard.as_mut().ok_or_else(|| finished(operation))?;
                query.execute(&mut **conn).await
            }
        };
        result
            .map(|r| r.rows_affected())
            .map_err(|e| e.classify(operation))
    }

    pub(crate) async fn fetch_all(
        &self,
        operation: &str,
        sql: &str,
        params: &[Value],
    ) -> DbResult<Vec<AnyRow>> {
        let query = bind_all(sqlx::query(sql), params);
        let result = match self {
            Self::Pool(pool) => query.fetch_all(pool).await,
            Self::Transaction(tx) => {
                let mut guard = tx.inner.lock().await;
                let conn = guard.as_mut().ok_or_else(|| finished(operation))?;
                query.fetch_all(&mut **conn).await
            }
        };
        result.map_err(|e| e.classify(operation))
    }

    pub(crate) async fn fetch_optional(
        &self,
        operation: &str,
        sql: &str,
        params: &[Value],
    ) -> DbResult<Option<AnyRow>> {
        let query = bind_all(sqlx::query(sql), params);
        let result = match self {
            Self::Pool(pool) => query.fetch_optional(pool).await,
            Self::Transaction(tx) => {
                let mut guard = tx.inner.lock().await;
                let conn = guard.as_mut().ok_or_else(|| finished(operation))?;
                query.fetch_optional(&mut **conn).await
            }
        };
        result.map_err(|e| e.classify(operation))
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[Value],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            Value::Text(s) => query.bind(s.clone()),
            Value::Integer(n) => query.bind(*n),
            Value::Float(n) => query.bind(*n),
            Value::Boolean(b) => query.bind(*b),
            Value::Timestamp(ts) => query.bind(ts.timestamp_millis()),
            Value::Null => query.bind(None::<String>),
            Value::NullInteger => query.bind(None::<i64>),
            // Lists are expanded into scalars while rendering
            Value::TextList(values) => query.bind(values.join(",")),
            Value::IntegerList(values) => query.bind(
                values
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        };
    }
    query
}
