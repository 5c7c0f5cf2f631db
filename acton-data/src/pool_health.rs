//! Connection pool health monitoring

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a pool within the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolRole {
    Primary,
    Replica,
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Replica => write!(f, "replica"),
        }
    }
}

/// Last known health of a pool
///
/// Only the health loop and `check_health_now` mutate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for PoolHealth {
    /// Pools start healthy; the pool was just opened successfully
    fn default() -> Self {
        Self {
            healthy: true,
            last_checked: None,
            consecutive_failures: 0,
        }
    }
}

impl PoolHealth {
    /// Record a successful probe; returns true if the pool recovered
    pub fn record_success(&mut self, at: DateTime<Utc>) -> bool {
        let recovered = !self.healthy;
        self.healthy = true;
        self.consecutive_failures = 0;
        self.last_checked = Some(at);
        recovered
    }

    /// Record a failed probe; returns true if the pool just became unhealthy
    pub fn record_failure(&mut self, at: DateTime<Utc>, max_failures: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_checked = Some(at);
        if self.healthy && self.consecutive_failures >= max_failures.max(1) {
            self.healthy = false;
            return true;
        }
        false
    }
}

/// Outcome of one probe, published to health subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub pool: String,
    pub role: PoolRole,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Connection counts of a pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Configured maximum
    pub max_open: u32,
    /// Connections currently open
    pub open: u32,
    /// Idle connections
    pub idle: u32,
    /// Connections checked out
    pub in_use: u32,
    /// Open connections as a share of the maximum (0-100)
    pub utilization_percent: f32,
}

impl PoolStats {
    /// Snapshot the counters of a live pool
    pub fn from_pool(pool: &sqlx::AnyPool) -> Self {
        let max_open = pool.options().get_max_connections();
        let open = pool.size();
        let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX).min(open);
        Self::from_counts(max_open, open, idle)
    }

    pub fn from_counts(max_open: u32, open: u32, idle: u32) -> Self {
        let utilization_percent = if max_open > 0 {
            ((open as f32 / max_open as f32) * 100.0).min(100.0)
        } else {
            0.0
        };
        Self {
            max_open,
            open,
            idle,
            in_use: open.saturating_sub(idle),
            utilization_percent,
        }
    }

    /// Sum of several pools' counters
    pub fn aggregate<'a>(stats: impl IntoIterator<Item = &'a PoolStats>) -> Self {
        let (max_open, open, idle) = stats.into_iter().fold((0u32, 0u32, 0u32), |acc, s| {
            (
                acc.0.saturating_add(s.max_open),
                acc.1.saturating_add(s.open),
                acc.2.saturating_add(s.idle),
            )
        });
        Self::from_counts(max_open, open, idle)
    }
}
