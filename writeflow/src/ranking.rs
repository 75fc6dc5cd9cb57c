//! Ranking snapshots under a cluster-wide lock.
//!
//! The ranking job recomputes top-N snapshots from durable aggregates on a
//! schedule. Exactly one instance across all service replicas executes the
//! body per tick: the named lock is held for at least the minimum hold time
//! (so a fast run does not let a second replica re-enter within the same
//! tick) and at most the maximum hold time (bounding leakage if the process
//! dies mid-run). Failing to acquire the lock means "skip this tick", not an
//! error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use crate::errors::RankingError;
use crate::event::{EventPayload, RankingPayload};
use crate::outbox::OutboxWriter;
use crate::store::{RankingMetric, RankingPeriod, Storage};

/// Cluster-wide mutual exclusion for scheduled jobs.
///
/// Lock names are scoped per logical job (`<JobName>_<methodName>`), so two
/// different jobs never contend on one lock.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// The lease handle; dropping it without release leaves the lock to
    /// expire at `max_hold`.
    type Lease: Send;

    /// Attempts to take the named lock. `None` means another holder is
    /// active — skip the tick.
    async fn try_acquire(
        &self,
        name: &str,
        min_hold: Duration,
        max_hold: Duration,
    ) -> Option<Self::Lease>;

    /// Releases a lease, keeping the lock held until its minimum hold time
    /// has passed.
    async fn release(&self, lease: Self::Lease);
}

/// Ranking job tuning knobs.
#[derive(Debug, Clone)]
pub struct RankingConfig {
    /// How often the job ticks.
    pub interval: Duration,
    /// Snapshot size per (metric, period) combination.
    pub top_n: usize,
    /// Minimum lock hold time; must exceed the expected execution time.
    pub lock_at_least: Duration,
    /// Maximum lock hold time; bounds leakage after a mid-run crash.
    pub lock_at_most: Duration,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            top_n: 10,
            lock_at_least: Duration::from_secs(30),
            lock_at_most: Duration::from_secs(300),
        }
    }
}

/// Lock name for the snapshot job, scoped job-then-method.
pub const RANKING_LOCK: &str = "RankingScheduler_publishSnapshots";

/// Every (metric, period) combination the job covers.
const COMBINATIONS: [(RankingMetric, RankingPeriod); 4] = [
    (RankingMetric::Views, RankingPeriod::Day),
    (RankingMetric::Views, RankingPeriod::Week),
    (RankingMetric::Likes, RankingPeriod::Day),
    (RankingMetric::Likes, RankingPeriod::Week),
];

/// Periodic, cluster-exclusive top-N snapshot publisher.
pub struct RankingScheduler<S: Storage, L> {
    storage: Arc<S>,
    writer: Arc<OutboxWriter<S>>,
    locks: Arc<L>,
    config: RankingConfig,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S, L> RankingScheduler<S, L>
where
    S: Storage + 'static,
    L: LockManager + 'static,
{
    /// Creates a scheduler. The writer must be registered for
    /// ranking-updated events.
    pub fn new(
        storage: Arc<S>,
        writer: Arc<OutboxWriter<S>>,
        locks: Arc<L>,
        config: RankingConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            storage,
            writer,
            locks,
            config,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Spawns the scheduled loop. Idempotent while running.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            info!("ranking scheduler started");
            let mut ticker = interval(scheduler.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        scheduler.run_once().await;
                    }
                }
            }
            info!("ranking scheduler stopped");
        }));
    }

    /// Signals the loop to stop and waits for it.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Runs one tick: acquire the lock or skip, then publish every
    /// combination. Returns the number of snapshots published.
    #[instrument(name = "ranking.tick", skip(self))]
    pub async fn run_once(&self) -> u32 {
        let Some(lease) = self
            .locks
            .try_acquire(
                RANKING_LOCK,
                self.config.lock_at_least,
                self.config.lock_at_most,
            )
            .await
        else {
            debug!("ranking lock held elsewhere, skipping tick");
            return 0;
        };

        let mut published = 0;
        for (metric, period) in COMBINATIONS {
            // One combination failing must not abort the others.
            match self.publish_snapshot(metric, period).await {
                Ok(true) => published += 1,
                Ok(false) => {}
                Err(error) => {
                    error!(?metric, ?period, %error, "ranking snapshot failed");
                }
            }
        }

        self.locks.release(lease).await;
        published
    }

    /// Publishes one (metric, period) snapshot if the ranking is non-empty.
    async fn publish_snapshot(
        &self,
        metric: RankingMetric,
        period: RankingPeriod,
    ) -> Result<bool, RankingError> {
        let entries = self
            .storage
            .top_entities(metric, period, self.config.top_n)
            .await?;
        if entries.is_empty() {
            return Ok(false);
        }

        let payload = EventPayload::RankingUpdated(RankingPayload {
            metric,
            period,
            entries,
        });

        let mut uow = self.storage.begin().await.map_err(RankingError::Storage)?;
        if let Err(error) = self.writer.publish(&mut uow, &payload).await {
            let _ = self.storage.rollback(uow).await;
            return Err(RankingError::Outbox(error));
        }
        self.storage.commit(uow).await.map_err(RankingError::Storage)?;

        debug!(?metric, ?period, "ranking snapshot published");
        Ok(true)
    }
}
