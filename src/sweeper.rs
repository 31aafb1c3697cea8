//! Background maintenance: cache TTL sweeps and durable retention sweeps.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use crate::cache::CacheStore;
use crate::config::CoordinatorConfig;
use crate::durable::DurableStore;

/// Running totals, readable while the sweeper runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub cache_sweeps: u64,
    pub cache_entries_expired: u64,
    pub retention_sweeps: u64,
    pub retention_failures: u64,
    pub facts_purged: u64,
    pub archived_purged: u64,
}

pub struct Sweeper {
    cache: Arc<CacheStore>,
    durable: Arc<DurableStore>,
    cache_every: Duration,
    retention_every: Duration,
    shutdown: Arc<Notify>,
    stats: Arc<Mutex<SweepStats>>,
}

impl Clone for Sweeper {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            durable: Arc::clone(&self.durable),
            cache_every: self.cache_every,
            retention_every: self.retention_every,
            shutdown: Arc::clone(&self.shutdown),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl Sweeper {
    pub fn new(cache: Arc<CacheStore>, durable: Arc<DurableStore>, config: &CoordinatorConfig) -> Self {
        Self {
            cache,
            durable,
            cache_every: config.cache_sweep_interval(),
            retention_every: config.retention_sweep_interval(),
            shutdown: Arc::new(Notify::new()),
            stats: Arc::new(Mutex::new(SweepStats::default())),
        }
    }

    /// Signal the sweeper to stop after its current pass.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub fn stats(&self) -> SweepStats {
        *self.stats.lock()
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.run().await })
    }

    /// Sweep on both intervals until shutdown. The first ticks fire at once.
    pub async fn run(&self) {
        let mut cache_tick = interval(self.cache_every);
        cache_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention_tick = interval(self.retention_every);
        retention_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            cache_every = ?self.cache_every,
            retention_every = ?self.retention_every,
            "sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("sweeper shutting down");
                    return;
                }
                _ = cache_tick.tick() => self.sweep_cache(),
                _ = retention_tick.tick() => self.sweep_retention().await,
            }
        }
    }

    pub fn sweep_cache(&self) {
        let removed = self.cache.sweep();
        let mut stats = self.stats.lock();
        stats.cache_sweeps += 1;
        stats.cache_entries_expired += removed.len() as u64;
        if !removed.is_empty() {
            debug!(expired = removed.len(), "cache sweep");
        }
    }

    pub async fn sweep_retention(&self) {
        match self.durable.sweep_retention().await {
            Ok(report) => {
                let mut stats = self.stats.lock();
                stats.retention_sweeps += 1;
                stats.facts_purged += report.facts_removed;
                stats.archived_purged += report.archived_removed;
            }
            Err(e) => {
                self.stats.lock().retention_failures += 1;
                error!(error = %e, "retention sweep failed");
            }
        }
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("cache_every", &self.cache_every)
            .field("retention_every", &self.retention_every)
            .finish_non_exhaustive()
    }
}
