//! Background Expiry Sweeper
//!
//! Lazy expiry (checking on access) is cheap but never reclaims a key that nobody
//! touches again. The sweeper closes that gap: it periodically schedules a sweep hop
//! on every shard, and each hop examines a bounded number of keys carrying a deadline
//! and removes the ones already past due. Because the work runs as a hop, it is
//! serialized with every other operation on that shard like any client command.
//!
//! ## Adaptive Frequency
//!
//! If a large fraction of the examined keys had expired, the sweeper halves its
//! interval; if nothing expired, it backs off by doubling it.

use crate::engine::ShardSet;
use crate::storage::SweepStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Base interval between sweeps (default: 100ms)
    pub base_interval: Duration,

    /// Minimum interval between sweeps (default: 10ms)
    pub min_interval: Duration,

    /// Maximum interval between sweeps (default: 1s)
    pub max_interval: Duration,

    /// If this fraction of examined keys are expired, speed up sweeping
    pub speedup_threshold: f64,

    /// Keys with a deadline examined per shard per sweep (default: 20)
    pub sweep_budget: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
            sweep_budget: 20,
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the sweeper as a background task on the current tokio runtime.
    pub fn start(shards: Arc<ShardSet>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(shards, config, shutdown_rx));

        info!("Background expiry sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the sweeper. Called automatically when the handle is dropped.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        debug!("Background expiry sweeper stopped");
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs one sweep hop on every shard and sums the results.
pub async fn sweep_once(shards: &ShardSet, budget: usize) -> Option<SweepStats> {
    match shards
        .run_on_all(move |db, op| db.sweep_expired(op.now_ms, budget))
        .await
    {
        Ok(per_shard) => Some(per_shard.into_iter().fold(
            SweepStats::default(),
            |acc, s| SweepStats {
                examined: acc.examined + s.examined,
                expired: acc.expired + s.expired,
            },
        )),
        Err(e) => {
            warn!(error = %e, "Expiry sweep failed");
            None
        }
    }
}

fn next_interval(current: Duration, stats: SweepStats, config: &ExpiryConfig) -> Duration {
    if stats.examined == 0 || stats.expired == 0 {
        return (current * 2).min(config.max_interval);
    }
    let rate = stats.expired as f64 / stats.examined as f64;
    if rate > config.speedup_threshold {
        (current / 2).max(config.min_interval)
    } else {
        current
    }
}

async fn sweeper_loop(
    shards: Arc<ShardSet>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut current_interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(current_interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let Some(stats) = sweep_once(&shards, config.sweep_budget).await else {
            continue;
        };

        let previous = current_interval;
        current_interval = next_interval(current_interval, stats, &config);
        if current_interval != previous {
            trace!(
                examined = stats.examined,
                expired = stats.expired,
                new_interval_ms = current_interval.as_millis() as u64,
                "Adjusted sweep interval"
            );
        }

        if stats.expired > 0 {
            debug!(expired = stats.expired, "Expired keys cleaned up");
        }
    }
}

/// Starts the expiry sweeper with default configuration.
pub fn start_expiry_sweeper(shards: Arc<ShardSet>) -> ExpirySweeper {
    ExpirySweeper::start(shards, ExpiryConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::{Clock, Entry, Value};
    use bytes::Bytes;

    fn populate(shards: &ShardSet, count: usize, expire_at: Option<u64>) {
        for i in 0..count {
            let key = Bytes::from(format!("key{}", i));
            let sid = shards.route_key(&key);
            shards.dispatch(sid, move |db, _| {
                db.insert(
                    key,
                    Entry::with_expiry(Value::String(Bytes::from("v")), expire_at),
                );
            });
        }
    }

    async fn total_keys(shards: &ShardSet) -> usize {
        shards.run_on_all(|db, _| db.len()).await.unwrap().into_iter().sum()
    }

    #[tokio::test]
    async fn test_sweeper_cleans_expired_keys() {
        let clock = Clock::manual(1_000);
        let shards = Arc::new(ShardSet::new(&EngineConfig::default(), clock.clone()).unwrap());

        populate(&shards, 50, Some(2_000));
        let persistent = Bytes::from("persistent");
        let sid = shards.route_key(&persistent);
        shards.dispatch(sid, move |db, _| {
            db.insert(persistent, Entry::new(Value::String(Bytes::from("v"))));
        });
        assert_eq!(total_keys(&shards).await, 51);

        clock.set_virtual_now(5_000);
        let config = ExpiryConfig {
            base_interval: Duration::from_millis(5),
            min_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(20),
            sweep_budget: 4,
            ..Default::default()
        };
        let _sweeper = ExpirySweeper::start(Arc::clone(&shards), config);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(total_keys(&shards).await, 1);
    }

    #[tokio::test]
    async fn test_sweep_once_respects_budget() {
        let clock = Clock::manual(0);
        let config = EngineConfig {
            shards: 1,
            ..EngineConfig::default()
        };
        let shards = ShardSet::new(&config, clock.clone()).unwrap();
        populate(&shards, 10, Some(100));
        clock.set_virtual_now(200);

        let stats = sweep_once(&shards, 3).await.unwrap();
        assert_eq!(stats, SweepStats { examined: 3, expired: 3 });
        assert_eq!(total_keys(&shards).await, 7);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let clock = Clock::manual(0);
        let shards = Arc::new(ShardSet::new(&EngineConfig::default(), clock.clone()).unwrap());
        let config = ExpiryConfig {
            base_interval: Duration::from_millis(5),
            ..Default::default()
        };

        {
            let _sweeper = ExpirySweeper::start(Arc::clone(&shards), config);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        populate(&shards, 5, Some(10));
        clock.set_virtual_now(100);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Nothing swept the keys, they are only logically expired.
        assert_eq!(total_keys(&shards).await, 5);
    }

    #[test]
    fn test_interval_adapts() {
        let config = ExpiryConfig::default();
        let busy = SweepStats { examined: 10, expired: 9 };
        let idle = SweepStats { examined: 10, expired: 0 };
        let base = config.base_interval;

        assert_eq!(next_interval(base, busy, &config), base / 2);
        assert_eq!(next_interval(base, idle, &config), base * 2);
        assert_eq!(
            next_interval(config.min_interval, busy, &config),
            config.min_interval
        );
        assert_eq!(
            next_interval(config.max_interval, idle, &config),
            config.max_interval
        );
    }
}
