//! Replica-lag throttling
//!
//! The bulk copy and the binlog streamer gate their progress on a
//! [`Throttler`]. The orchestrator only needs three things from it: a way to
//! wait until it is safe to proceed before locking, and a switch to disable it
//! while the source is write-locked (lag is irrelevant then) and re-enable it
//! afterwards.
//!
//! [`LagThrottler`] throttles while the lag reported by a [`LagSource`]
//! exceeds the configured maximum. How lag is measured is up to the source.

use crate::error::{Result, ShardError};
use crate::traits::LagSource;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lag throttler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Maximum tolerated replica lag in seconds
    #[serde(default = "default_max_lag_secs")]
    pub max_lag_secs: u64,

    /// How often lag is re-checked while throttled, in milliseconds
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
}

fn default_max_lag_secs() -> u64 {
    2
}

fn default_update_interval_ms() -> u64 {
    1000
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_lag_secs: default_max_lag_secs(),
            update_interval_ms: default_update_interval_ms(),
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_lag_secs == 0 {
            return Err(ShardError::validation(
                "throttle.max_lag_secs must be greater than 0",
            ));
        }
        if self.update_interval_ms == 0 {
            return Err(ShardError::validation(
                "throttle.update_interval_ms must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn max_lag(&self) -> Duration {
        Duration::from_secs(self.max_lag_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

/// Gate on copy/stream progress.
#[async_trait]
pub trait Throttler: Send + Sync {
    /// Whether progress should currently pause. A disabled throttler never
    /// throttles.
    async fn throttled(&self) -> bool;

    /// Globally enable or disable throttling.
    fn set_disabled(&self, disabled: bool);

    fn disabled(&self) -> bool;

    /// Delay between checks in [`wait_for_throttle`].
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(500)
    }
}

/// Block until `throttler` stops throttling.
///
/// There is no timeout here; a throttler that never clears keeps the caller
/// waiting.
pub async fn wait_for_throttle(throttler: &dyn Throttler) {
    let mut waited = 0u64;
    while throttler.throttled().await {
        waited += 1;
        tokio::time::sleep(throttler.poll_interval()).await;
    }
    if waited > 0 {
        debug!(checks = waited, "throttle cleared");
    }
}

/// Throttles while replica lag exceeds a maximum.
pub struct LagThrottler {
    config: ThrottleConfig,
    source: Arc<dyn LagSource>,
    disabled: AtomicBool,
    /// Checks that ended up throttled
    throttled_checks: AtomicU64,
}

impl LagThrottler {
    pub fn new(config: ThrottleConfig, source: Arc<dyn LagSource>) -> Self {
        Self {
            config,
            source,
            disabled: AtomicBool::new(false),
            throttled_checks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Number of checks that reported throttled so far.
    pub fn throttled_checks(&self) -> u64 {
        self.throttled_checks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Throttler for LagThrottler {
    async fn throttled(&self) -> bool {
        if self.disabled() {
            return false;
        }

        let throttled = match self.source.current_lag().await {
            Ok(lag) => lag > self.config.max_lag(),
            Err(e) => {
                // Unknown lag is treated as too much lag.
                warn!(error = %e, "failed to read replica lag, throttling");
                true
            }
        };

        if throttled {
            self.throttled_checks.fetch_add(1, Ordering::Relaxed);
        }
        throttled
    }

    fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
        debug!(disabled, "throttler toggled");
    }

    fn disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn poll_interval(&self) -> Duration {
        self.config.update_interval()
    }
}
