//! Counter reconciliation: folds hot-path deltas into the durable aggregate.
//!
//! Each pass walks the pending-entity set. Per entity, in its own unit of
//! work: claim the view and like deltas (atomic get-and-delete), apply them
//! to the durable aggregate, publish a viewed event carrying the new durable
//! total, commit, and only then clear the pending mark. One entity's failure
//! never rolls back or blocks its siblings — that isolation is the reason
//! each entity gets its own transaction instead of one batch transaction.
//!
//! Failure boundary, by design: if the claim succeeded but the durable apply
//! fails (the entity was deleted concurrently), that delta is lost for this
//! cycle and the loss is logged with the claimed values. If the claim itself
//! failed, the pending mark survives and the next scheduled pass picks the
//! entity up again. Best-effort at this edge, never double-applied.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::counter::CounterStore;
use crate::errors::ReconcileError;
use crate::event::{BoardViewPayload, EventPayload};
use crate::outbox::OutboxWriter;
use crate::store::Storage;
use crate::types::EntityId;

/// Reconciler tuning knobs.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often a reconciliation pass runs.
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entities whose deltas were folded into the durable aggregate.
    pub reconciled: u32,
    /// Entities that were pending with nothing to fold (no-op success).
    pub skipped: u32,
    /// Entities whose reconciliation failed; isolated, logged, siblings
    /// unaffected.
    pub failed: u32,
}

/// Scheduled job draining pending counter deltas into the durable aggregate.
pub struct CounterReconciler<C, S: Storage> {
    counters: Arc<C>,
    storage: Arc<S>,
    writer: Arc<OutboxWriter<S>>,
    config: ReconcilerConfig,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C, S> CounterReconciler<C, S>
where
    C: CounterStore + 'static,
    S: Storage + 'static,
{
    /// Creates a reconciler over the given counter store and durable
    /// storage. The writer publishes the follow-up viewed events and must be
    /// registered for them.
    pub fn new(
        counters: Arc<C>,
        storage: Arc<S>,
        writer: Arc<OutboxWriter<S>>,
        config: ReconcilerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            counters,
            storage,
            writer,
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

        let reconciler = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            info!("counter reconciler started");
            let mut ticker = interval(reconciler.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        reconciler.run_once().await;
                    }
                }
            }
            info!("counter reconciler stopped");
        }));
    }

    /// Signals the loop to stop and waits for it.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Runs one reconciliation pass over every pending entity.
    ///
    /// Safe to run concurrently from multiple instances: the claim step is
    /// an atomic get-and-delete, so two racing reconcilers split the
    /// entities between them rather than double-applying a delta.
    #[instrument(name = "reconciler.pass", skip(self))]
    pub async fn run_once(&self) -> ReconcileReport {
        let pending = match self.counters.pending_entities().await {
            Ok(pending) => pending,
            Err(error) => {
                error!(%error, "could not list pending entities");
                return ReconcileReport::default();
            }
        };

        let mut report = ReconcileReport::default();
        for entity_id in pending {
            match self.reconcile_entity(entity_id).await {
                Ok(true) => report.reconciled += 1,
                Ok(false) => report.skipped += 1,
                Err(error) => {
                    error!(%entity_id, %error, "entity reconciliation failed");
                    report.failed += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            debug!(
                reconciled = report.reconciled,
                skipped = report.skipped,
                failed = report.failed,
                "reconciliation pass complete"
            );
        }
        report
    }

    /// Reconciles one entity in its own unit of work. Returns `Ok(true)`
    /// when deltas were folded, `Ok(false)` for a clean no-op.
    async fn reconcile_entity(&self, entity_id: EntityId) -> Result<bool, ReconcileError> {
        let view_delta = self.counters.claim_view_delta(entity_id).await?.unwrap_or(0);
        let like_delta = self.counters.claim_like_delta(entity_id).await?.unwrap_or(0);

        if view_delta == 0 && like_delta == 0 {
            // Nothing pending after all (already claimed by a sibling run,
            // or the mark outlived its delta). Idempotent success.
            self.counters.clear_pending(entity_id).await?;
            return Ok(false);
        }

        let mut uow = self.storage.begin().await.map_err(ReconcileError::Storage)?;

        let totals = match self
            .storage
            .apply_counter_deltas(&mut uow, entity_id, view_delta, like_delta)
            .await
        {
            Ok(totals) => totals,
            Err(error) => {
                self.abandon(uow, entity_id, view_delta, like_delta).await;
                return Err(ReconcileError::Storage(error));
            }
        };

        if view_delta > 0 {
            let payload = EventPayload::BoardViewed(BoardViewPayload {
                board_id: entity_id,
                view_count: totals.view_count,
            });
            if let Err(error) = self.writer.publish(&mut uow, &payload).await {
                self.abandon(uow, entity_id, view_delta, like_delta).await;
                return Err(ReconcileError::Outbox(error));
            }
        }

        if let Err(error) = self.storage.commit(uow).await {
            error!(
                %entity_id,
                view_delta,
                like_delta,
                %error,
                "commit failed; claimed deltas dropped"
            );
            return Err(ReconcileError::Storage(error));
        }

        if let Err(error) = self.counters.clear_pending(entity_id).await {
            // The fold committed; the stale mark costs one no-op pass later.
            warn!(%entity_id, %error, "could not clear pending mark");
        }

        debug!(
            %entity_id,
            view_delta,
            like_delta,
            view_total = totals.view_count,
            like_total = totals.like_count,
            "deltas folded into durable aggregate"
        );
        Ok(true)
    }

    /// Rolls back and logs the claimed-but-unapplied deltas that this cycle
    /// is dropping.
    async fn abandon(&self, uow: S::UnitOfWork, entity_id: EntityId, view_delta: i64, like_delta: i64) {
        if let Err(rollback_error) = self.storage.rollback(uow).await {
            warn!(%entity_id, %rollback_error, "rollback failed");
        }
        error!(
            %entity_id,
            view_delta,
            like_delta,
            "durable apply failed; claimed deltas dropped for this cycle"
        );
    }
}
