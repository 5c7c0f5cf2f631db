//! Connection manager lifecycle against file-backed SQLite databases

mod common;

use std::time::{Duration, Instant};

use acton_data::config::{DatabaseConfig, ReplicaConfig};
use acton_data::error::ErrorKind;
use acton_data::manager::ConnectionManager;
use acton_data::pool_health::PoolRole;
use common::{quiet_config, sqlite_url};

const UNREACHABLE_REPLICA: &str = "sqlite:///nonexistent_dir_xyz/replica.db";

fn with_replica(primary: &str, replica: &str) -> DatabaseConfig {
    let mut config = quiet_config(primary);
    config.replicas.push(ReplicaConfig::from_url(replica));
    config
}

#[tokio::test]
async fn test_invalid_pool_bounds_fail_before_connecting() {
    // The URL cannot be opened; a connection attempt would not yield a configuration error
    let mut config = quiet_config("sqlite:///nonexistent_dir_xyz/primary.db");
    config.pool.max_connections = 10;
    config.pool.min_connections = 20;

    let error = ConnectionManager::new(config).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Configuration);
}

#[tokio::test]
async fn test_unreachable_primary_is_fatal() {
    let error = ConnectionManager::new(quiet_config("sqlite:///nonexistent_dir_xyz/primary.db"))
        .await
        .unwrap_err();
    assert_ne!(error.kind, ErrorKind::Configuration);
}

#[tokio::test]
async fn test_unreachable_replica_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = with_replica(&sqlite_url(&dir, "primary.db"), UNREACHABLE_REPLICA);

    let manager = ConnectionManager::new(config).await.unwrap();

    assert!(manager.all_read().is_empty());
    assert_eq!(manager.read().role(), PoolRole::Primary);
    assert_eq!(manager.pool_health().len(), 1);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_reads_rotate_over_replicas() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = with_replica(&sqlite_url(&dir, "primary.db"), &sqlite_url(&dir, "r0.db"));
    config.replicas.push(ReplicaConfig::from_url(sqlite_url(&dir, "r1.db")));

    let manager = ConnectionManager::new(config).await.unwrap();
    assert_eq!(manager.all_read().len(), 2);

    let names: Vec<String> = (0..4).map(|_| manager.read().name().to_string()).collect();
    assert!(names.iter().all(|n| n.starts_with("replica-")));
    assert!(names.contains(&"replica-0".to_string()));
    assert!(names.contains(&"replica-1".to_string()));
    assert_eq!(manager.primary().role(), PoolRole::Primary);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_failing_replica_becomes_unhealthy_and_reads_fall_back() {
    let dir = tempfile::tempdir().unwrap();
    let config = with_replica(&sqlite_url(&dir, "primary.db"), &sqlite_url(&dir, "replica.db"));
    let max_failures = config.health_check.max_failures;

    let manager = ConnectionManager::new(config).await.unwrap();
    let mut events = manager.subscribe_health();

    manager.all_read()[0].pool().close().await;

    for _ in 1..max_failures {
        manager.check_health_now().await;
    }
    assert!(manager.pool_health()["replica-0"].healthy);

    let results = manager.check_health_now().await;
    let replica = results.iter().find(|r| r.pool == "replica-0").unwrap();
    assert!(!replica.healthy);
    assert!(replica.error.is_some());

    let health = manager.pool_health();
    assert!(!health["replica-0"].healthy);
    assert_eq!(health["replica-0"].consecutive_failures, max_failures);
    assert!(health["primary"].healthy);
    assert!(manager.is_healthy());

    assert_eq!(manager.read().role(), PoolRole::Primary);

    let event = events.recv().await.unwrap();
    assert!(event.timestamp <= chrono::Utc::now());

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_health_check_that_times_out_counts_as_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quiet_config(&sqlite_url(&dir, "primary.db"));
    config.pool.max_connections = 1;
    config.pool.min_connections = 1;
    config.pool.acquire_timeout_ms = 30_000;
    config.health_check.timeout_ms = 100;
    let max_failures = config.health_check.max_failures;

    let manager = ConnectionManager::new(config).await.unwrap();
    // Hold the only connection so the health check cannot acquire one
    let held = manager.primary().pool().acquire().await.unwrap();

    let started = Instant::now();
    let results = manager.check_health_now().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let primary = results.iter().find(|r| r.pool == "primary").unwrap();
    assert!(primary.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(primary.healthy, max_failures > 1);
    assert_eq!(manager.pool_health()["primary"].consecutive_failures, 1);

    drop(held);
    let results = manager.check_health_now().await;
    assert!(results[0].error.is_none());
    assert_eq!(manager.pool_health()["primary"].consecutive_failures, 0);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_stats_cover_primary_and_replicas() {
    let dir = tempfile::tempdir().unwrap();
    let config = with_replica(&sqlite_url(&dir, "primary.db"), &sqlite_url(&dir, "replica.db"));
    let manager = ConnectionManager::new(config).await.unwrap();

    let stats = manager.stats();
    assert!(stats.contains_key("primary"));
    assert!(stats.contains_key("read_replicas"));
    assert_eq!(stats["primary"].max_open, 4);
    assert_eq!(stats["read_replicas"].max_open, 4);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quiet_config(&sqlite_url(&dir, "primary.db"));
    config.health_check.enabled = true;
    config.health_check.interval_ms = 20;

    let manager = ConnectionManager::new(config).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;

    manager.close().await.unwrap();
    assert!(manager.is_closed());
    manager.close().await.unwrap();
    assert!(manager.primary().pool().is_closed());
}
