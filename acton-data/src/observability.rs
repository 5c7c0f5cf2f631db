//! Tracing setup and metrics reporting
//!
//! The crate logs through the `tracing` facade and never installs a
//! subscriber on its own. [`init_tracing`] is a convenience for binaries and
//! tests.
//!
//! Operation metrics go through the [`MetricsCollector`] trait. Collectors are
//! invoked synchronously on the caller's task after the operation finished; a
//! panicking collector is caught and logged so it can never fail the
//! operation it reports on. Exporters that do I/O should sit behind
//! [`ChannelMetrics`] and drain its receiver on their own task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::pool_health::PoolStats;

/// Install a global `tracing` subscriber
///
/// `RUST_LOG` wins over the configured level. Installing twice is an error.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    installed.map_err(|e| Error::Tracing(e.to_string()))?;

    tracing::info!(level = %config.level, json = config.json, "tracing initialized");
    Ok(())
}

/// Receiver of repository and pool metrics
///
/// Every method runs inline on the task that performed the operation, so
/// implementations must return without blocking or awaiting I/O.
pub trait MetricsCollector: Send + Sync {
    /// One finished repository operation
    fn record_query_metrics(
        &self,
        operation: &str,
        table: &str,
        duration: Duration,
        success: bool,
        rows_affected: u64,
    );

    /// Pool counters sampled by the health loop
    fn record_connection_metrics(&self, pool: &str, stats: &PoolStats);

    /// A classified failure
    fn record_error_metrics(&self, operation: &str, kind: ErrorKind);
}

/// Collector that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn record_query_metrics(&self, _: &str, _: &str, _: Duration, _: bool, _: u64) {}

    fn record_connection_metrics(&self, _: &str, _: &PoolStats) {}

    fn record_error_metrics(&self, _: &str, _: ErrorKind) {}
}

/// Collector that emits metrics as `tracing` events on the `acton_data::metrics` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsCollector for TracingMetrics {
    fn record_query_metrics(
        &self,
        operation: &str,
        table: &str,
        duration: Duration,
        success: bool,
        rows_affected: u64,
    ) {
        tracing::debug!(
            target: "acton_data::metrics",
            operation,
            table,
            duration_ms = duration.as_millis() as u64,
            success,
            rows_affected,
            "query"
        );
    }

    fn record_connection_metrics(&self, pool: &str, stats: &PoolStats) {
        tracing::debug!(
            target: "acton_data::metrics",
            pool,
            max_open = stats.max_open,
            open = stats.open,
            idle = stats.idle,
            in_use = stats.in_use,
            utilization_percent = stats.utilization_percent,
            "pool"
        );
    }

    fn record_error_metrics(&self, operation: &str, kind: ErrorKind) {
        tracing::debug!(
            target: "acton_data::metrics",
            operation,
            kind = %kind,
            "error"
        );
    }
}

/// One metrics sample as forwarded by [`ChannelMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub enum MetricSample {
    Query {
        operation: String,
        table: String,
        duration: Duration,
        success: bool,
        rows_affected: u64,
    },
    Connection {
        pool: String,
        stats: PoolStats,
    },
    Error {
        operation: String,
        kind: ErrorKind,
    },
}

/// Collector that hands samples to a bounded channel
///
/// Sending never waits: when the buffer is full or the receiver is gone the
/// sample is dropped and counted.
#[derive(Debug)]
pub struct ChannelMetrics {
    tx: mpsc::Sender<MetricSample>,
    dropped: AtomicU64,
}

impl ChannelMetrics {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MetricSample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let collector = Self {
            tx,
            dropped: AtomicU64::new(0),
        };
        (collector, rx)
    }

    /// Samples discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, sample: MetricSample) {
        if self.tx.try_send(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl MetricsCollector for ChannelMetrics {
    fn record_query_metrics(
        &self,
        operation: &str,
        table: &str,
        duration: Duration,
        success: bool,
        rows_affected: u64,
    ) {
        self.send(MetricSample::Query {
            operation: operation.to_string(),
            table: table.to_string(),
            duration,
            success,
            rows_affected,
        });
    }

    fn record_connection_metrics(&self, pool: &str, stats: &PoolStats) {
        self.send(MetricSample::Connection {
            pool: pool.to_string(),
            stats: stats.clone(),
        });
    }

    fn record_error_metrics(&self, operation: &str, kind: ErrorKind) {
        self.send(MetricSample::Error {
            operation: operation.to_string(),
            kind,
        });
    }
}

/// Invoke a collector, swallowing any panic it raises
pub(crate) fn report(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(metric = what, "metrics collector panicked; sample dropped");
    }
}
