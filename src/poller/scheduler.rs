//! Telemetry poller - background task for periodic statistics collection.
//!
//! Every tick the poller takes a registry snapshot and sends each datapath
//! three requests: port statistics, flow statistics and table statistics.
//! It never waits for replies. Those arrive later as ordinary events and are
//! turned into records by `replies`.
//!
//! # Independence
//!
//! The loop shares nothing with packet handling except the registry, which it
//! only snapshots:
//! - A switch that registers after a snapshot is polled on the next tick
//! - A switch removed before a snapshot is not polled
//! - A switch that never answers contributes no records; there is no retry
//!
//! # Missed Ticks
//!
//! A tick that fires late (runtime starvation) is skipped rather than
//! replayed, so a stalled runtime never produces a burst of polls.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use super::service::{PollService, PollStats};
use crate::registry::DatapathRegistry;
use crate::types::now_ms;
use log::{debug, info};

/// Configuration for the telemetry poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Whether the poller runs at all
    pub enabled: bool,
    /// Interval between polls
    pub poll_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1000,
        }
    }
}

impl PollerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Totals across every tick since start.
#[derive(Debug, Clone, Default)]
pub struct PollerTotals {
    pub ticks: u64,
    pub requests_sent: u64,
    pub requests_dropped: u64,
}

/// Timer-driven statistics poller.
///
/// Spawned once at startup and stopped through the shutdown channel.
pub struct TelemetryPoller {
    service: PollService,
    config: PollerConfig,
    /// Timestamp of the last completed tick
    last_poll_at: Arc<RwLock<u64>>,
    totals: RwLock<PollerTotals>,
}

impl TelemetryPoller {
    /// Creates a new poller over `registry`.
    ///
    /// # Arguments
    /// * `registry` - Datapaths to poll, snapshotted on every tick
    /// * `config` - Whether to run and the tick interval
    ///
    /// # Returns
    /// A poller that does nothing until `start` is spawned.
    ///
    /// # Example
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use fabric::poller::{PollerConfig, TelemetryPoller};
    /// use fabric::DatapathRegistry;
    ///
    /// let registry = Arc::new(DatapathRegistry::new());
    /// let config = PollerConfig {
    ///     enabled: true,
    ///     poll_interval_ms: 5_000,
    /// };
    /// let poller = TelemetryPoller::new(registry, config);
    /// ```
    pub fn new(registry: Arc<DatapathRegistry>, config: PollerConfig) -> Self {
        Self {
            service: PollService::new(registry),
            config,
            last_poll_at: Arc::new(RwLock::new(0)),
            totals: RwLock::new(PollerTotals::default()),
        }
    }

    /// Milliseconds since UNIX epoch of the last tick, 0 before the first.
    pub fn last_poll(&self) -> u64 {
        *self.last_poll_at.read()
    }

    pub fn totals(&self) -> PollerTotals {
        self.totals.read().clone()
    }

    /// Runs the timer loop until `shutdown` flips to true or its sender is dropped.
    ///
    /// Returns immediately when the poller is disabled. Otherwise it will:
    /// 1. Wait one full interval
    /// 2. Poll every registered datapath
    /// 3. Update totals and the last-poll timestamp
    /// 4. Repeat until shutdown, then log the totals
    ///
    /// # Arguments
    /// * `shutdown` - Loop exits when this flips to `true` or its sender drops
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use fabric::poller::{PollerConfig, TelemetryPoller};
    /// # use fabric::DatapathRegistry;
    /// # async fn run() {
    /// # let registry = Arc::new(DatapathRegistry::new());
    /// let poller = Arc::new(TelemetryPoller::new(registry, PollerConfig::default()));
    /// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    /// let task = tokio::spawn(poller.clone().start(shutdown_rx));
    ///
    /// shutdown_tx.send(true).ok();
    /// task.await.ok();
    /// # }
    /// ```
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Telemetry poller is disabled, skipping");
            return;
        }

        let period = self.config.poll_interval();
        info!("Starting telemetry poller with {}ms interval", period.as_millis());

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let totals = self.totals();
        info!(
            "Telemetry poller stopped after {} ticks ({} requests sent, {} dropped)",
            totals.ticks, totals.requests_sent, totals.requests_dropped
        );
    }

    /// Executes one tick: snapshot, then three requests per datapath.
    pub fn poll_once(&self) -> PollStats {
        let stats = self.service.poll_all();

        {
            let mut totals = self.totals.write();
            totals.ticks += 1;
            totals.requests_sent += stats.requests_sent as u64;
            totals.requests_dropped += stats.requests_dropped as u64;
        }
        *self.last_poll_at.write() = now_ms();

        debug!(
            "Poll tick: {} datapaths, {} requests sent, {} dropped",
            stats.datapaths, stats.requests_sent, stats.requests_dropped
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{SwitchCommand, SwitchHandle};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHandle {
        sent: Mutex<Vec<SwitchCommand>>,
    }

    impl SwitchHandle for RecordingHandle {
        fn send(&self, command: SwitchCommand) -> Result<(), String> {
            self.sent.lock().push(command);
            Ok(())
        }
    }

    #[test]
    fn test_poller_config_defaults() {
        let config = PollerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = PollerConfig {
            poll_interval_ms: 0,
            enabled: true,
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_removed_datapath_is_not_polled() {
        let registry = Arc::new(DatapathRegistry::new());
        let kept = Arc::new(RecordingHandle::default());
        let removed = Arc::new(RecordingHandle::default());
        registry.register(1, kept.clone());
        let connection = registry.register(2, removed.clone());
        registry.unregister(2, connection);

        let poller = TelemetryPoller::new(registry, PollerConfig::default());
        let stats = poller.poll_once();

        assert_eq!(stats.requests_sent, 3);
        assert_eq!(kept.sent.lock().len(), 3);
        assert!(removed.sent.lock().is_empty());
        assert_eq!(poller.totals().ticks, 1);
        assert!(poller.last_poll() > 0);
    }

    #[tokio::test]
    async fn test_timer_loop_polls_until_shutdown() {
        let registry = Arc::new(DatapathRegistry::new());
        let handle = Arc::new(RecordingHandle::default());
        registry.register(1, handle.clone());

        let poller = Arc::new(TelemetryPoller::new(
            registry,
            PollerConfig {
                enabled: true,
                poll_interval_ms: 10,
            },
        ));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&poller).start(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        let ticks = poller.totals().ticks;
        assert!(ticks >= 1);
        assert_eq!(handle.sent.lock().len() as u64, ticks * 3);

        // Stopped: no further requests.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(poller.totals().ticks, ticks);
    }

    #[tokio::test]
    async fn test_disabled_poller_returns_immediately() {
        let registry = Arc::new(DatapathRegistry::new());
        let poller = Arc::new(TelemetryPoller::new(
            registry,
            PollerConfig {
                enabled: false,
                poll_interval_ms: 10,
            },
        ));
        let (_tx, rx) = watch::channel(false);
        poller.clone().start(rx).await;
        assert_eq!(poller.totals().ticks, 0);
    }
}
