//! Outbox relay: drains committed records to the broker.
//!
//! A background poll loop fetches records older than a short delay and
//! publishes them. Success deletes the record; failure increments its retry
//! count until the cap, after which the record moves to the dead-letter
//! store. A crash between broker-ack and deletion produces a duplicate
//! publish, which downstream consumers tolerate by idempotent handling keyed
//! on the event id — delivery is at-least-once by design.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::broker::MessageBroker;
use crate::errors::StorageResult;
use crate::store::{DeadLetterRecord, FailureSource, OutboxRecord, Storage};
use crate::types::Topic;

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often the poll loop wakes up.
    pub poll_interval: Duration,
    /// Only records older than this are fetched, leaving just-committed
    /// transactions time to finish.
    pub relay_delay: Duration,
    /// Maximum records fetched per pass.
    pub batch_size: usize,
    /// Failed publish attempts before a record is dead-lettered.
    pub max_retries: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            relay_delay: Duration::from_secs(10),
            batch_size: 100,
            max_retries: 3,
        }
    }
}

/// Outcome counts of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayPass {
    /// Records published and removed from the outbox.
    pub relayed: u32,
    /// Records whose retry count was bumped for a later pass.
    pub retried: u32,
    /// Records routed to the dead-letter store.
    pub dead_lettered: u32,
    /// Records skipped because storage bookkeeping itself failed.
    pub failed: u32,
}

enum Disposition {
    Relayed,
    Retried,
    DeadLettered,
}

/// Background poller draining the outbox to a broker topic.
///
/// Multiple relay instances may run concurrently across service replicas;
/// racing on the same record at worst duplicates a publish, never loses one.
pub struct OutboxRelay<S, B> {
    storage: Arc<S>,
    broker: Arc<B>,
    topic: Topic,
    config: RelayConfig,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S, B> OutboxRelay<S, B>
where
    S: Storage + 'static,
    B: MessageBroker + 'static,
{
    /// Creates a relay publishing to `topic`.
    pub fn new(storage: Arc<S>, broker: Arc<B>, topic: Topic, config: RelayConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            storage,
            broker,
            topic,
            config,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Spawns the poll loop. Idempotent while running.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let relay = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            info!(topic = %relay.topic, "outbox relay started");
            let mut ticker = interval(relay.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = relay.run_once().await {
                            error!(%error, "relay pass failed");
                        }
                    }
                }
            }
            info!("outbox relay stopped");
        }));
    }

    /// Signals the loop to stop and waits for it.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Runs a single relay pass. Public so schedulers and tests can drive
    /// the relay without the background loop.
    #[instrument(name = "relay.pass", skip(self))]
    pub async fn run_once(&self) -> StorageResult<RelayPass> {
        let records = self
            .storage
            .fetch_relayable(
                self.config.relay_delay,
                self.config.max_retries,
                self.config.batch_size,
            )
            .await?;

        let mut pass = RelayPass::default();
        for record in records {
            match self.relay_record(&record).await {
                Ok(Disposition::Relayed) => pass.relayed += 1,
                Ok(Disposition::Retried) => pass.retried += 1,
                Ok(Disposition::DeadLettered) => pass.dead_lettered += 1,
                Err(error) => {
                    // Bookkeeping failure for one record must not stop the
                    // batch; the record stays in the outbox for a later pass.
                    error!(event_id = %record.event_id, %error, "relay bookkeeping failed");
                    pass.failed += 1;
                }
            }
        }

        if pass != RelayPass::default() {
            debug!(
                relayed = pass.relayed,
                retried = pass.retried,
                dead_lettered = pass.dead_lettered,
                failed = pass.failed,
                "relay pass complete"
            );
        }
        Ok(pass)
    }

    async fn relay_record(&self, record: &OutboxRecord) -> StorageResult<Disposition> {
        match self.broker.publish(&self.topic, &record.payload).await {
            Ok(()) => {
                if let Err(error) = self.storage.delete_outbox(record.event_id).await {
                    // The publish already happened; the next pass will
                    // publish again and downstream dedupes by event id.
                    warn!(
                        event_id = %record.event_id,
                        %error,
                        "published but could not delete outbox record; duplicate relay expected"
                    );
                }
                Ok(Disposition::Relayed)
            }
            Err(publish_error) => {
                let retries = self.storage.bump_outbox_retry(record.event_id).await?;
                if retries >= self.config.max_retries {
                    let dead = DeadLetterRecord::from_outbox(
                        &OutboxRecord {
                            retry_count: retries,
                            ..record.clone()
                        },
                        FailureSource::Relay,
                        &publish_error.to_string(),
                    );
                    self.storage.append_dead_letter(&dead).await?;
                    self.storage.delete_outbox(record.event_id).await?;
                    error!(
                        event_id = %record.event_id,
                        retries,
                        %publish_error,
                        "outbox record dead-lettered"
                    );
                    Ok(Disposition::DeadLettered)
                } else {
                    warn!(
                        event_id = %record.event_id,
                        retries,
                        %publish_error,
                        "publish failed, will retry"
                    );
                    Ok(Disposition::Retried)
                }
            }
        }
    }
}
