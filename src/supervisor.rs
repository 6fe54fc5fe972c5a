//! Connection supervision
//!
//! The transport itself never reconnects beyond its single fallback attempt.
//! [`ConnectionSupervisor`] watches connectivity and re-runs `connect()` with
//! backoff until the link is back, the attempt budget is spent, or shutdown
//! is requested.

use crate::error::{DispatchError, NestResult};
use crate::transport::mqtt::{HealthMonitor, ReconnectConfig, ReconnectionDecision};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    poll_interval: Duration,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        reconnect: ReconnectConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            reconnect,
            poll_interval,
        }
    }

    /// Supervise until shutdown
    ///
    /// Returns `Ok(())` on shutdown, or the last connection error once
    /// `max_attempts` consecutive reconnects have failed.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> NestResult<()> {
        let mut attempts = 0u32;
        let mut last_error: Option<DispatchError> = None;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Connection supervisor stopping");
                        return Ok(());
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if self.transport.is_connected() {
                if attempts > 0 {
                    info!(attempts, "Broker connection restored");
                    attempts = 0;
                    last_error = None;
                }
                continue;
            }

            let decision = HealthMonitor::should_attempt_reconnection(
                attempts,
                &self.reconnect,
                *shutdown_rx.borrow(),
            );

            match decision {
                ReconnectionDecision::AbortShutdownRequested => return Ok(()),
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    error!(attempts, "Giving up on broker connection");
                    return Err(last_error.unwrap_or(DispatchError::NotConnected));
                }
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    attempts = attempt;
                    info!(attempt, delay_ms, "Reconnecting to broker");

                    if !Self::interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                        return Ok(());
                    }

                    match self.transport.connect().await {
                        Ok(target) => {
                            info!(broker = %target, attempt, "Reconnected");
                            attempts = 0;
                            last_error = None;
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "Reconnect attempt failed");
                            last_error = Some(e.into());
                        }
                    }
                }
            }
        }
    }

    /// Sleep for `delay_ms`; false if shutdown arrived first
    ///
    /// Changes that leave the flag false do not shorten the delay.
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received during reconnection delay, stopping");
                        return false;
                    }
                }
                _ = &mut sleep => return true,
            }
        }
    }
}
