//! Heartbeat loop — keeps the TTL check passing.
//!
//! Ticks on a fixed wall-clock schedule (the first tick fires
//! immediately) and sends a "passing" TTL update for the instance's
//! check on every tick. Calls never overlap: a slow call delays the next
//! one, and missed ticks are caught up back to back.
//!
//! A failed update is retried with exponential backoff while the error
//! is transient, the retry budget lasts, and the next attempt would still
//! land before the coordination service deregisters the instance
//! (`last success + ttl + deregister_after`). Anything else ends the loop
//! with `AgentError::Heartbeat`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use rollcall_catalog::{CheckId, CheckStatus, CoordinationClient};

use crate::config::AgentConfig;
use crate::error::AgentError;

/// Exponential backoff: doubles per step up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { current: base, max }
    }

    /// The delay to wait now; the following one is doubled.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

/// Retry budget for a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt. 0 fails fast.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Fail on the first error without retrying.
    pub fn fail_fast() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

/// Periodic TTL updater for one check.
pub struct HeartbeatLoop {
    client: Arc<dyn CoordinationClient>,
    check_id: CheckId,
    note: String,
    interval: Duration,
    /// Time after the last success at which the instance is gone.
    grace: Duration,
    retry: RetryPolicy,
}

impl HeartbeatLoop {
    pub fn new(client: Arc<dyn CoordinationClient>, check_id: CheckId, config: &AgentConfig) -> Self {
        Self {
            client,
            check_id,
            note: config.check.note.clone(),
            interval: config.heartbeat_interval(),
            grace: config.check.ttl.saturating_add(config.check.deregister_after),
            retry: RetryPolicy {
                max_retries: config.heartbeat.max_retries,
                base_backoff: config.heartbeat.base_backoff,
                max_backoff: config.heartbeat.max_backoff,
            },
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until shutdown is signalled or a heartbeat fails for good.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut last_success = Instant::now();

        info!(check_id = %self.check_id, interval = ?self.interval, "heartbeat loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.beat(&mut last_success, &mut shutdown).await?;
                }
                _ = shutdown.changed() => break,
            }
        }

        info!(check_id = %self.check_id, "heartbeat loop shutting down");
        Ok(())
    }

    /// One tick: update the TTL, retrying within budget.
    async fn beat(
        &self,
        last_success: &mut Instant,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        let mut backoff = Backoff::new(self.retry.base_backoff, self.retry.max_backoff);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let result = self
                .client
                .update_ttl(&self.check_id, &self.note, CheckStatus::Passing)
                .await;

            let err = match result {
                Ok(()) => {
                    *last_success = Instant::now();
                    if attempts > 1 {
                        info!(check_id = %self.check_id, attempts, "heartbeat recovered");
                    } else {
                        debug!(check_id = %self.check_id, "heartbeat sent");
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            let delay = backoff.next_delay();
            let remaining = self.grace.saturating_sub(last_success.elapsed());
            if !err.is_transient() || attempts > self.retry.max_retries || delay >= remaining {
                return Err(AgentError::Heartbeat {
                    attempts,
                    source: err,
                });
            }

            warn!(
                check_id = %self.check_id,
                error = %err,
                attempts,
                retry_in = ?delay,
                "heartbeat failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rollcall_catalog::{CatalogError, HealthCheck, MemoryCatalog, ServiceInstance};

    use super::*;

    const CHECK: &str = "service:svc_53211";

    async fn registered_catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        let instance = ServiceInstance {
            id: "svc_53211".to_string(),
            name: "mycluster".to_string(),
            tags: BTreeSet::from(["login".to_string()]),
            address: "127.0.0.1".to_string(),
            port: 53211,
            check: HealthCheck {
                check_id: CHECK.to_string(),
                ttl: Duration::from_secs(8),
                deregister_after: Duration::from_secs(8),
                tls_skip_verify: true,
                initial_status: CheckStatus::Critical,
            },
        };
        catalog.register(&instance).await.unwrap();
        catalog
    }

    fn heartbeat(catalog: &MemoryCatalog) -> HeartbeatLoop {
        HeartbeatLoop::new(
            Arc::new(catalog.clone()),
            CHECK.to_string(),
            &AgentConfig::default(),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(4));
        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn oversized_durations_saturate() {
        let mut config = AgentConfig::default();
        config.check.ttl = Duration::MAX;
        config.check.deregister_after = Duration::MAX;
        let hb = HeartbeatLoop::new(Arc::new(MemoryCatalog::new()), CHECK.to_string(), &config);

        assert_eq!(hb.grace, Duration::MAX);
        assert!(hb.interval() < Duration::MAX);

        let mut backoff = Backoff::new(Duration::MAX, Duration::MAX);
        assert_eq!(backoff.next_delay(), Duration::MAX);
        assert_eq!(backoff.next_delay(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn first_heartbeat_is_immediate_then_every_interval() {
        let catalog = registered_catalog().await;
        let hb = heartbeat(&catalog);
        assert_eq!(hb.interval(), Duration::from_secs(5));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { hb.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(4900)).await;
        let updates = catalog.ttl_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, CheckStatus::Passing);
        assert_eq!(updates[0].note, "online");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(catalog.ttl_updates().len(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(catalog.ttl_updates().len(), 3);
        assert_eq!(catalog.check_status(CHECK), Some(CheckStatus::Passing));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn check_stays_passing_while_heartbeating() {
        let catalog = registered_catalog().await;
        let hb = heartbeat(&catalog);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { hb.run(shutdown_rx).await });

        for _ in 0..12 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            assert_eq!(catalog.check_status(CHECK), Some(CheckStatus::Passing));
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_ends_loop_on_first_error() {
        let catalog = registered_catalog().await;
        catalog.fail_next_ttl_updates(1);
        let hb = heartbeat(&catalog).with_retry(RetryPolicy::fail_fast());

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = hb.run(shutdown_rx).await.unwrap_err();

        assert!(matches!(err, AgentError::Heartbeat { attempts: 1, .. }));
        assert_eq!(catalog.ttl_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retries_before_failure() {
        let catalog = registered_catalog().await;
        catalog.fail_next_ttl_updates(100);
        let hb = heartbeat(&catalog);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = hb.run(shutdown_rx).await.unwrap_err();

        // Default budget: 1 attempt + 3 retries (0.5s, 1s, 2s).
        assert!(matches!(err, AgentError::Heartbeat { attempts: 4, .. }));
        assert_eq!(catalog.ttl_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_within_budget() {
        let catalog = registered_catalog().await;
        catalog.fail_next_ttl_updates(2);
        let hb = heartbeat(&catalog);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { hb.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(catalog.ttl_attempts(), 3);
        assert_eq!(catalog.ttl_updates().len(), 1);
        assert_eq!(catalog.check_status(CHECK), Some(CheckStatus::Passing));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_deregistration_deadline() {
        let catalog = registered_catalog().await;
        catalog.fail_next_ttl_updates(100);
        let hb = heartbeat(&catalog).with_retry(RetryPolicy {
            max_retries: 10,
            base_backoff: Duration::from_secs(4),
            max_backoff: Duration::from_secs(30),
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = hb.run(shutdown_rx).await.unwrap_err();

        // Attempts at 0s, 4s, 12s; the next would land at 28s, past 16s.
        assert!(matches!(err, AgentError::Heartbeat { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_check_is_fatal_without_retry() {
        let catalog = MemoryCatalog::new();
        let hb = heartbeat(&catalog);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = hb.run(shutdown_rx).await.unwrap_err();

        match err {
            AgentError::Heartbeat { attempts, source } => {
                assert_eq!(attempts, 1);
                assert_eq!(source, CatalogError::CheckNotFound(CHECK.to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_loop() {
        let catalog = registered_catalog().await;
        let hb = heartbeat(&catalog);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { hb.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());

        let count = catalog.ttl_updates().len();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(catalog.ttl_updates().len(), count);
    }
}
