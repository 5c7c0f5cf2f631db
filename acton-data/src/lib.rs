//! # acton-data
//!
//! Data access on top of sqlx: pooled connections with read replicas, a
//! generic repository, and error classification with cancellable retries.
//!
//! ## Features
//!
//! - **Connection management**: primary pool, weighted read replicas, background health checks
//! - **Generic repository**: CRUD, offset and cursor pagination, batch ingestion, scoped transactions
//! - **Error taxonomy**: driver errors classified into [`ErrorKind`](error::ErrorKind) with severity
//! - **Retries**: bounded exponential backoff with jitter that stops on cancellation
//! - **Configuration**: defaults, TOML file and `ACTON_DATA_` environment variables via figment
//!
//! ## Example
//!
//! ```rust,no_run
//! use acton_data::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration
//!     let config = Config::load()?;
//!
//!     // Initialize tracing
//!     init_tracing(&config.logging)?;
//!
//!     // Open the primary and any replicas
//!     let manager = ConnectionManager::new(config.database.clone()).await?;
//!
//!     // Reads can go to a replica
//!     let health = manager.pool_health();
//!     tracing::info!(pools = health.len(), "database ready");
//!
//!     manager.close().await?;
//!     Ok(())
//! }
//! ```

pub mod classifier;
pub mod config;
mod database;
pub mod error;
pub mod ids;
pub mod manager;
pub mod observability;
pub mod pool_health;
pub mod repository;
pub mod retry;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::classifier::{ClassificationRule, Classify, ErrorClassifier};
    pub use crate::config::{
        Config, DatabaseConfig, HealthCheckConfig, LoggingConfig, PoolSettings, ReplicaConfig,
        RepositoryConfig,
    };
    pub use crate::error::{DatabaseError, DbResult, Error, ErrorKind, Result, Severity};
    pub use crate::ids::{IdGenerator, TypeIdGenerator};
    pub use crate::manager::{ConnectionManager, PoolHandle};
    pub use crate::observability::{
        init_tracing, ChannelMetrics, MetricSample, MetricsCollector, NoopMetrics, TracingMetrics,
    };
    pub use crate::pool_health::{HealthCheckResult, PoolHealth, PoolRole, PoolStats};
    pub use crate::repository::{
        Audit, Cursor, CursorDirection, CursorPage, DbHandle, Entity, FieldError, FilterCondition,
        FilterOperator, OrderDirection, Pagination, Repository, TableSchema, ValidationResult,
        Validator, Value,
    };
    pub use crate::retry::{RetryConfig, RetryHandler, RetryPolicy};

    pub use tokio_util::sync::CancellationToken;
}
