//! Database connection pool creation

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tokio_util::sync::CancellationToken;

use crate::classifier::Classify;
use crate::config::PoolSettings;
use crate::error::{sanitize_url, DbResult};
use crate::retry::RetryHandler;

/// Open a pool, retrying connection attempts under `retry`
///
/// Installs the sqlx `Any` drivers on first use.
pub(crate) async fn open_pool(
    name: &str,
    url: &str,
    settings: &PoolSettings,
    retry: &RetryHandler,
    cancel: &CancellationToken,
) -> DbResult<AnyPool> {
    sqlx::any::install_default_drivers();

    let operation = format!("connect {}", name);
    let result = retry
        .retry_with_cancellation(cancel, &operation, || try_open_pool(url, settings))
        .await;

    match result {
        Ok(pool) => {
            tracing::info!(
                pool = name,
                url = %sanitize_url(url),
                max = settings.max_connections,
                min = settings.min_connections,
                "database connection pool created"
            );
            Ok(pool)
        }
        Err(error) => {
            tracing::error!(
                pool = name,
                url = %sanitize_url(url),
                attempts = error.retry_count + 1,
                error = %error,
                hint = categorize(&error.kind),
                "failed to connect to database"
            );
            Err(error.with_cause(format!("connecting to '{}'", sanitize_url(url))))
        }
    }
}

/// Single connection attempt
async fn try_open_pool(url: &str, settings: &PoolSettings) -> Result<AnyPool, sqlx::Error> {
    AnyPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout())
        .idle_timeout(Some(settings.idle_timeout()))
        .max_lifetime(Some(settings.max_lifetime()))
        .connect(url)
        .await
}

/// Close a pool, bounded by `timeout`
pub(crate) async fn close_pool(
    name: &str,
    pool: &AnyPool,
    timeout: std::time::Duration,
) -> DbResult<()> {
    tokio::time::timeout(timeout, pool.close())
        .await
        .map_err(|e| e.classify(&format!("close {}", name)))
}

/// Operator guidance for a failed connection
fn categorize(kind: &crate::error::ErrorKind) -> &'static str {
    use crate::error::ErrorKind;
    match kind {
        ErrorKind::Configuration => "check the connection URL format and driver name",
        ErrorKind::Connection => "verify the database is running and reachable",
        ErrorKind::Timeout => "the database may be overloaded or max_connections too high",
        ErrorKind::Cancelled => "connection attempt cancelled during shutdown",
        _ => "check credentials and database permissions",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::retry::RetryPolicy;

    #[tokio::test]
    async fn test_open_in_memory_sqlite() {
        let settings = PoolSettings {
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let retry = RetryHandler::new(RetryPolicy::no_retry());
        let pool = open_pool("primary", "sqlite::memory:", &settings, &retry, &CancellationToken::new())
            .await
            .unwrap();

        let one: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one.0, 1);
        close_pool("primary", &pool, std::time::Duration::from_secs(1))
            .await
            .unwrap();
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_unreachable_sqlite_file_fails() {
        let settings = PoolSettings::default();
        let retry = RetryHandler::new(RetryPolicy::no_retry());
        let error = open_pool(
            "replica-0",
            "sqlite:///nonexistent_dir_xyz/replica.db",
            &settings,
            &retry,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_ne!(error.kind, ErrorKind::Cancelled);
        assert_eq!(error.retry_count, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_connect() {
        let token = CancellationToken::new();
        token.cancel();
        let retry = RetryHandler::new(RetryPolicy::default());
        let error = open_pool("primary", "sqlite::memory:", &PoolSettings::default(), &retry, &token)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Cancelled);
    }
}
