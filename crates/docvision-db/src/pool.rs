//! Database connection pool, sized from the pipeline's concurrency.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use docvision_core::{Error, GovernorConfig, Result};

/// Connections beyond one per inference slot: both intake pollers, the
/// backend monitor, and startup recovery.
pub const POOL_HEADROOM: u32 = 3;

pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_governor(&GovernorConfig::default())
    }
}

impl PoolConfig {
    /// One connection per job the governor can run at once, plus headroom.
    ///
    /// Every in-flight job persists its status changes, so a smaller pool
    /// would stall transitions behind inference slots.
    pub fn for_governor(governor: &GovernorConfig) -> Self {
        let slots = governor.gpu_max_concurrent + governor.cpu_max_concurrent;
        Self {
            max_connections: u32::try_from(slots)
                .unwrap_or(u32::MAX)
                .saturating_add(POOL_HEADROOM),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

pub async fn create_pool(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(1)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "established",
        max_connections = config.max_connections,
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub size: u32,
    pub idle: usize,
}

impl PoolUsage {
    /// Every open connection is checked out.
    pub fn saturated(&self) -> bool {
        self.size > 0 && self.idle == 0
    }
}

/// Log current pool usage; warns when jobs are waiting on connections.
pub fn log_pool_metrics(pool: &PgPool) -> PoolUsage {
    let usage = PoolUsage {
        size: pool.size(),
        idle: pool.num_idle(),
    };
    debug!(
        subsystem = "db",
        component = "pool",
        op = "metrics",
        pool_size = usage.size,
        pool_idle = usage.idle,
        "Pool usage"
    );
    if usage.saturated() {
        warn!(
            subsystem = "db",
            component = "pool",
            pool_size = usage.size,
            "Connection pool saturated, job transitions may stall"
        );
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sized_for_inference_slots() {
        let governor = GovernorConfig::default().with_caps(4, 2);
        let config = PoolConfig::for_governor(&governor);
        assert_eq!(config.max_connections, 6 + POOL_HEADROOM);
        assert_eq!(
            config.acquire_timeout,
            Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_saturation() {
        assert!(PoolUsage { size: 4, idle: 0 }.saturated());
        assert!(!PoolUsage { size: 4, idle: 1 }.saturated());
        assert!(!PoolUsage { size: 0, idle: 0 }.saturated());
    }
}
