//! Connection watchdog
//!
//! Periodic liveness probe against the transport. Enough consecutive
//! failures force a reconnect regardless of what the error-triggered
//! debounce is doing.

use super::classifier::classify;
use super::ClientSupervisor;
use std::sync::Arc;
use std::time::Duration;

/// Watchdog tuning.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub max_failures: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_failures: 5,
        }
    }
}

/// Run the probe loop until the process exits.
pub async fn run(supervisor: Arc<ClientSupervisor>, config: WatchdogConfig) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    loop {
        ticker.tick().await;

        if !supervisor.is_leader().await {
            consecutive_failures = 0;
            continue;
        }

        match supervisor.ping().await {
            Ok(()) => {
                consecutive_failures = 0;
            }
            Err(err) => {
                consecutive_failures += 1;
                tracing::warn!(
                    consecutive_failures,
                    error = %err,
                    "watchdog probe failed"
                );

                if consecutive_failures >= config.max_failures {
                    tracing::warn!("watchdog forcing reconnect");
                    supervisor.force_reconnect(classify(&err)).await;
                    consecutive_failures = 0;
                }
            }
        }
    }
}
