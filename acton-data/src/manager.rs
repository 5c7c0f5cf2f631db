//! Primary and replica pool lifecycle
//!
//! A [`ConnectionManager`] owns one primary pool and any number of read
//! replica pools. A single background task probes every pool with
//! `SELECT 1` on a fixed interval and is the only writer of pool health.
//! Pool handles, health and configuration share one `parking_lot::RwLock`
//! that is never held across an await point.
//!
//! ## Health state machine
//!
//! A pool starts healthy. It turns unhealthy after `max_failures`
//! consecutive failed probes and healthy again on the next successful one.
//! Every probe result is published on a bounded broadcast channel; slow
//! subscribers lose the oldest results and never stall the loop.
//!
//! ## Read routing
//!
//! [`ConnectionManager::read`] rotates over healthy replicas proportionally
//! to their weight and falls back to the primary when none is healthy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use sqlx::AnyPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{DatabaseConfig, HealthCheckConfig};
use crate::database::{close_pool, open_pool};
use crate::error::{DatabaseError, DbResult};
use crate::observability::{report, MetricsCollector, NoopMetrics};
use crate::pool_health::{HealthCheckResult, PoolHealth, PoolRole, PoolStats};
use crate::retry::{RetryHandler, RetryPolicy};

/// Capacity of the health broadcast channel
const HEALTH_CHANNEL_CAPACITY: usize = 64;

/// Upper bound for closing a single pool
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Named handle to one of the manager's pools
///
/// Cloning is cheap; the underlying `AnyPool` is reference counted.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    name: String,
    role: PoolRole,
    pool: AnyPool,
}

impl PoolHandle {
    pub fn new(name: impl Into<String>, role: PoolRole, pool: AnyPool) -> Self {
        Self {
            name: name.into(),
            role,
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

impl From<PoolHandle> for AnyPool {
    fn from(handle: PoolHandle) -> Self {
        handle.pool
    }
}

#[derive(Debug)]
struct ManagedPool {
    name: String,
    role: PoolRole,
    pool: AnyPool,
    weight: u32,
    health: PoolHealth,
}

impl ManagedPool {
    fn handle(&self) -> PoolHandle {
        PoolHandle::new(self.name.clone(), self.role, self.pool.clone())
    }
}

#[derive(Debug)]
struct ManagerState {
    primary: ManagedPool,
    replicas: Vec<ManagedPool>,
    config: DatabaseConfig,
}

struct Inner {
    state: RwLock<ManagerState>,
    next_replica: AtomicUsize,
    closed: AtomicBool,
    health_tx: broadcast::Sender<HealthCheckResult>,
    shutdown: CancellationToken,
    health_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Owner of the primary and replica pools
///
/// # Example
///
/// ```rust,no_run
/// use acton_data::config::DatabaseConfig;
/// use acton_data::manager::ConnectionManager;
///
/// # async fn example() -> acton_data::error::DbResult<()> {
/// let manager = ConnectionManager::new(DatabaseConfig::from_url("postgres://app@localhost/app")).await?;
/// let reads = manager.read();
/// let writes = manager.primary();
/// # let _ = (reads, writes);
/// manager.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("ConnectionManager")
            .field("primary", &state.primary.name)
            .field("replicas", &state.replicas.len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ConnectionManager {
    /// Validate `config`, open every pool and start the health loop
    ///
    /// A configuration error is returned before any connection attempt.
    /// Failing to open the primary is fatal; a replica that cannot be
    /// opened is logged and skipped.
    pub async fn new(config: DatabaseConfig) -> DbResult<Self> {
        Self::new_with_metrics(config, Arc::new(NoopMetrics)).await
    }

    /// Like [`ConnectionManager::new`], reporting pool counters to `metrics`
    pub async fn new_with_metrics(
        config: DatabaseConfig,
        metrics: Arc<dyn MetricsCollector>,
    ) -> DbResult<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let retry = RetryHandler::new(RetryPolicy::from(&config.retry));

        let primary_pool = open_pool(
            "primary",
            &config.primary_url(),
            &config.pool,
            &retry,
            &shutdown,
        )
        .await?;
        let primary = ManagedPool {
            name: "primary".to_string(),
            role: PoolRole::Primary,
            pool: primary_pool,
            weight: 1,
            health: PoolHealth::default(),
        };

        let mut replicas = Vec::with_capacity(config.replicas.len());
        for (index, replica) in config.replicas.iter().enumerate() {
            let name = replica.display_name(index);
            let url = config.replica_url(replica);
            match open_pool(&name, &url, &config.pool, &retry, &shutdown).await {
                Ok(pool) => replicas.push(ManagedPool {
                    name,
                    role: PoolRole::Replica,
                    pool,
                    weight: replica.weight,
                    health: PoolHealth::default(),
                }),
                Err(error) => {
                    tracing::warn!(
                        replica = %name,
                        error = %error,
                        "skipping read replica that could not be opened"
                    );
                }
            }
        }

        tracing::info!(
            replicas = replicas.len(),
            configured_replicas = config.replicas.len(),
            "connection manager ready"
        );

        let health_check = config.health_check.clone();
        let (health_tx, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            state: RwLock::new(ManagerState {
                primary,
                replicas,
                config,
            }),
            next_replica: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            health_tx,
            shutdown,
            health_task: tokio::sync::Mutex::new(None),
            metrics,
        });

        if health_check.enabled {
            let handle = tokio::spawn(run_health_loop(
                Arc::downgrade(&inner),
                inner.shutdown.clone(),
                health_check.interval(),
            ));
            *inner.health_task.lock().await = Some(handle);
        }

        Ok(Self { inner })
    }

    /// Handle to the primary pool, for writes
    pub fn primary(&self) -> PoolHandle {
        self.inner.state.read().primary.handle()
    }

    /// Handle for a read
    ///
    /// Rotates over healthy replicas by weight; the primary when no replica
    /// is healthy or none is configured.
    pub fn read(&self) -> PoolHandle {
        let state = self.inner.state.read();
        let candidates: Vec<(bool, u32)> = state
            .replicas
            .iter()
            .map(|r| (r.health.healthy, r.weight))
            .collect();
        let ticket = self.inner.next_replica.fetch_add(1, Ordering::Relaxed);

        match select_weighted(&candidates, ticket) {
            Some(index) => state.replicas[index].handle(),
            None => state.primary.handle(),
        }
    }

    /// Handles to every replica, healthy or not
    pub fn all_read(&self) -> Vec<PoolHandle> {
        self.inner
            .state
            .read()
            .replicas
            .iter()
            .map(ManagedPool::handle)
            .collect()
    }

    /// Whether the primary passed its last health check
    pub fn is_healthy(&self) -> bool {
        self.inner.state.read().primary.health.healthy
    }

    /// Last known health of every pool, keyed by pool name
    pub fn pool_health(&self) -> HashMap<String, PoolHealth> {
        let state = self.inner.state.read();
        std::iter::once(&state.primary)
            .chain(state.replicas.iter())
            .map(|p| (p.name.clone(), p.health.clone()))
            .collect()
    }

    /// Connection counters under `"primary"` and `"read_replicas"`
    pub fn stats(&self) -> HashMap<String, PoolStats> {
        let state = self.inner.state.read();
        let replica_stats: Vec<PoolStats> = state
            .replicas
            .iter()
            .map(|r| PoolStats::from_pool(&r.pool))
            .collect();

        let mut stats = HashMap::with_capacity(2);
        stats.insert("primary".to_string(), PoolStats::from_pool(&state.primary.pool));
        stats.insert(
            "read_replicas".to_string(),
            PoolStats::aggregate(replica_stats.iter()),
        );
        stats
    }

    /// The validated configuration the manager was built with
    pub fn config(&self) -> DatabaseConfig {
        self.inner.state.read().config.clone()
    }

    /// Subscribe to health check results
    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthCheckResult> {
        self.inner.health_tx.subscribe()
    }

    /// Probe every pool once, outside the regular schedule
    pub async fn check_health_now(&self) -> Vec<HealthCheckResult> {
        self.inner.check_all().await
    }

    /// Stop the health loop and close every pool
    ///
    /// Every pool is closed even if an earlier one fails; the first error is
    /// returned. Calling `close` again is a no-op.
    pub async fn close(&self) -> DbResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.health_task.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "health check task ended abnormally");
            }
        }

        let pools: Vec<(String, AnyPool)> = {
            let state = self.inner.state.read();
            std::iter::once(&state.primary)
                .chain(state.replicas.iter())
                .map(|p| (p.name.clone(), p.pool.clone()))
                .collect()
        };

        let mut first_error: Option<DatabaseError> = None;
        for (name, pool) in pools {
            if let Err(error) = close_pool(&name, &pool, CLOSE_TIMEOUT).await {
                tracing::error!(pool = %name, error = %error, "failed to close pool");
                first_error.get_or_insert(error);
            }
        }

        tracing::info!("connection manager closed");
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Inner {
    async fn check_all(&self) -> Vec<HealthCheckResult> {
        let (targets, policy) = {
            let state = self.state.read();
            let targets: Vec<(String, PoolRole, AnyPool)> = std::iter::once(&state.primary)
                .chain(state.replicas.iter())
                .map(|p| (p.name.clone(), p.role, p.pool.clone()))
                .collect();
            (targets, state.config.health_check.clone())
        };

        let probes = targets
            .iter()
            .map(|(_, _, pool)| probe(pool, policy.timeout()));
        let outcomes = futures::future::join_all(probes).await;

        let now = Utc::now();
        let mut results = Vec::with_capacity(targets.len());
        {
            let mut state = self.state.write();
            let ManagerState {
                primary, replicas, ..
            } = &mut *state;
            let managed = std::iter::once(primary).chain(replicas.iter_mut());

            for (pool, outcome) in managed.zip(outcomes) {
                apply_outcome(pool, outcome.as_ref().err(), now, &policy);
                results.push(HealthCheckResult {
                    pool: pool.name.clone(),
                    role: pool.role,
                    healthy: pool.health.healthy,
                    error: outcome.err(),
                    timestamp: now,
                });
            }
        }

        for (name, _, pool) in &targets {
            let stats = PoolStats::from_pool(pool);
            report("connection", || self.metrics.record_connection_metrics(name, &stats));
        }

        for result in &results {
            // No receivers is not an error
            let _ = self.health_tx.send(result.clone());
        }

        results
    }
}

fn apply_outcome(
    pool: &mut ManagedPool,
    error: Option<&String>,
    now: chrono::DateTime<Utc>,
    policy: &HealthCheckConfig,
) {
    match error {
        None => {
            if pool.health.record_success(now) {
                tracing::info!(pool = %pool.name, role = %pool.role, "pool recovered");
            }
        }
        Some(error) => {
            let failures = pool.health.consecutive_failures + 1;
            if pool.health.record_failure(now, policy.max_failures) {
                tracing::error!(
                    pool = %pool.name,
                    role = %pool.role,
                    consecutive_failures = failures,
                    error = %error,
                    "pool marked unhealthy"
                );
            } else {
                tracing::warn!(
                    pool = %pool.name,
                    role = %pool.role,
                    consecutive_failures = failures,
                    error = %error,
                    "health check failed"
                );
            }
        }
    }
}

async fn probe(pool: &AnyPool, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(pool)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("health check timed out after {:?}", timeout)),
    }
}

async fn run_health_loop(inner: Weak<Inner>, shutdown: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; pools were just opened
    ticker.tick().await;

    tracing::debug!(interval_ms = interval.as_millis() as u64, "health check loop started");
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(manager) = inner.upgrade() else { break };
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => break,
                    _ = manager.check_all() => {}
                }
            }
        }
    }
    tracing::debug!("health check loop stopped");
}

/// Pick a healthy candidate for `ticket`, proportionally to weight
fn select_weighted(candidates: &[(bool, u32)], ticket: usize) -> Option<usize> {
    let total: u64 = candidates
        .iter()
        .filter(|(healthy, _)| *healthy)
        .map(|(_, weight)| u64::from(*weight))
        .sum();
    if total == 0 {
        return None;
    }

    let mut slot = ticket as u64 % total;
    for (index, (healthy, weight)) in candidates.iter().enumerate() {
        if !healthy {
            continue;
        }
        let weight = u64::from(*weight);
        if slot < weight {
            return Some(index);
        }
        slot -= weight;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_weighted_respects_weights() {
        let candidates = [(true, 1), (true, 3)];
        let picks: Vec<usize> = (0..8)
            .filter_map(|t| select_weighted(&candidates, t))
            .collect();
        assert_eq!(picks.iter().filter(|&&i| i == 0).count(), 2);
        assert_eq!(picks.iter().filter(|&&i| i == 1).count(), 6);
    }

    #[test]
    fn test_select_weighted_skips_unhealthy() {
        let candidates = [(false, 5), (true, 1), (false, 2)];
        for ticket in 0..10 {
            assert_eq!(select_weighted(&candidates, ticket), Some(1));
        }
    }

    #[test]
    fn test_select_weighted_none_healthy() {
        assert_eq!(select_weighted(&[(false, 1), (false, 1)], 0), None);
        assert_eq!(select_weighted(&[], 3), None);
    }

    #[test]
    fn test_select_weighted_survives_ticket_overflow() {
        assert!(select_weighted(&[(true, 2), (true, 2)], usize::MAX).is_some());
    }
}
