use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use cadence_core::types::{ItemId, OwnerId};
use futures_util::{stream, StreamExt};
use rusqlite::Connection;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    dispatcher::{Dispatcher, WorkerPool},
    error::Result,
    publisher::PublisherRegistry,
    retry::RetryPolicy,
    store::ItemStore,
    types::{
        ClaimedItem, ItemFilter, ItemStats, ItemUpdate, NewItem, PublishAttempt, ScheduleItem,
    },
    worker::PublishWorker,
};

/// Owner-facing management API. Cheap to clone; runs on its own connection so
/// HTTP handlers never contend with the scanner's queries.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: ItemStore,
    dispatcher: Dispatcher,
    policy: RetryPolicy,
    wake: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl SchedulerHandle {
    /// Create a pending item. Wakes the scanner when it is already due.
    pub fn create(&self, req: NewItem) -> Result<ScheduleItem> {
        let now = self.clock.now();
        let item = self.store.create(req, self.policy.max_attempts, now)?;
        if item.next_run_at.is_some_and(|at| at <= now) {
            self.wake.notify_one();
        }
        Ok(item)
    }

    pub fn get(&self, id: &ItemId) -> Result<ScheduleItem> {
        self.store.get(id)
    }

    pub fn list(&self, filter: &ItemFilter) -> Result<Vec<ScheduleItem>> {
        self.store.list(filter)
    }

    pub fn update(&self, id: &ItemId, update: ItemUpdate) -> Result<ScheduleItem> {
        self.store.update(id, update, self.clock.now())
    }

    pub fn delete(&self, id: &ItemId) -> Result<()> {
        self.store.delete(id)
    }

    pub fn activate(&self, id: &ItemId) -> Result<ScheduleItem> {
        let item = self.store.activate(id, self.clock.now())?;
        self.wake.notify_one();
        Ok(item)
    }

    pub fn pause(&self, id: &ItemId) -> Result<ScheduleItem> {
        self.store.pause(id, self.clock.now())
    }

    pub fn cancel(&self, id: &ItemId) -> Result<ScheduleItem> {
        self.store.cancel(id, self.clock.now())
    }

    /// Re-arm a failed item for immediate execution.
    pub fn retry(&self, id: &ItemId) -> Result<ScheduleItem> {
        let item = self.store.retry(id, self.clock.now())?;
        self.wake.notify_one();
        Ok(item)
    }

    /// Claim the item right away, regardless of `next_run_at`, and queue it.
    ///
    /// Returns the item as claimed (`in_flight`). If the queue refuses it the
    /// claim is released and the error returned.
    pub fn send_now(&self, id: &ItemId) -> Result<ScheduleItem> {
        let claim = self.store.claim_now(id, self.clock.now())?;
        let item = claim.item.clone();
        self.dispatcher.dispatch(claim)?;
        info!(item_id = %id, "item sent for immediate publication");
        Ok(item)
    }

    /// Items a scan would claim right now.
    pub fn due(&self, limit: u32) -> Result<Vec<ScheduleItem>> {
        self.store.due(self.clock.now(), limit)
    }

    pub fn stats(&self, owner_id: Option<&OwnerId>) -> Result<ItemStats> {
        self.store.stats(owner_id)
    }

    pub fn attempts(&self, id: &ItemId) -> Result<Vec<PublishAttempt>> {
        // surface NotFound rather than an empty log for unknown ids
        self.store.get(id)?;
        self.store.attempts(id)
    }

    /// Ask the scanner to run a scan without waiting for the next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

/// Periodic scanner: claims due items and hands them to the worker pool.
pub struct SchedulerEngine {
    store: ItemStore,
    dispatcher: Dispatcher,
    worker: PublishWorker,
    rx: Option<mpsc::Receiver<ClaimedItem>>,
    policy: RetryPolicy,
    interval: Duration,
    batch: u32,
    concurrency: usize,
    lease: chrono::Duration,
    wake: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl SchedulerEngine {
    /// Create an engine on the wall clock, initialising the DB schema if needed.
    pub fn new(conn: Connection, registry: PublisherRegistry, cfg: &SchedulerConfig) -> Result<Self> {
        Self::with_clock(conn, registry, cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(
        conn: Connection,
        registry: PublisherRegistry,
        cfg: &SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = ItemStore::new(conn)?;
        let policy = RetryPolicy::from_config(cfg);
        let (dispatcher, rx) = Dispatcher::channel(store.clone(), clock.clone(), cfg.queue_capacity);
        let lease_secs = cfg
            .claim_lease_secs
            .max(cfg.publish_timeout_secs.saturating_mul(2))
            .max(1);
        let lease = chrono::Duration::seconds(
            i64::try_from(lease_secs)
                .unwrap_or(i64::MAX)
                .min(i64::MAX / 1_000),
        );
        let worker = PublishWorker::new(
            store.clone(),
            Arc::new(registry),
            policy.clone(),
            Duration::from_secs(cfg.publish_timeout_secs.max(1)),
            clock.clone(),
        );
        Ok(Self {
            store,
            dispatcher,
            worker,
            rx: Some(rx),
            policy,
            interval: Duration::from_secs(cfg.scan_interval_secs.max(1)),
            batch: cfg.scan_batch.max(1),
            concurrency: cfg.worker_concurrency.max(1),
            lease,
            wake: Arc::new(Notify::new()),
            clock,
        })
    }

    /// Management handle backed by its own connection to the same database.
    pub fn handle(&self, conn: Connection) -> Result<SchedulerHandle> {
        Ok(SchedulerHandle {
            store: ItemStore::new(conn)?,
            dispatcher: self.dispatcher.clone(),
            policy: self.policy.clone(),
            wake: self.wake.clone(),
            clock: self.clock.clone(),
        })
    }

    /// Claim due items and queue them for the worker pool.
    ///
    /// Returns how many items were queued. Claims the queue refuses are
    /// released and retried on a later scan.
    pub fn scan_once(&self) -> Result<usize> {
        let now = self.clock.now();
        self.reap(now);
        let claimed = self.store.claim_due(now, self.batch)?;
        if claimed.is_empty() {
            debug!("scan found nothing due");
            return Ok(0);
        }

        let total = claimed.len();
        let mut queued = 0;
        for claim in claimed {
            if self.dispatcher.dispatch(claim).is_ok() {
                queued += 1;
            }
        }
        info!(claimed = total, queued, "scan dispatched due items");
        Ok(queued)
    }

    /// Claim due items and execute them inline, waiting for every outcome.
    ///
    /// Used by one-shot invocations (cron-driven `--scan-once`) and tests;
    /// the long-running path is [`SchedulerEngine::run`].
    pub async fn run_pending(&self) -> Result<usize> {
        let now = self.clock.now();
        self.reap(now);
        let claimed = self.store.claim_due(now, self.batch)?;
        let total = claimed.len();

        stream::iter(claimed)
            .for_each_concurrent(self.concurrency, |claim| {
                let worker = self.worker.clone();
                async move {
                    let id = claim.item.id.clone();
                    if let Err(e) = worker.execute(claim).await {
                        error!(item_id = %id, "worker failed to apply outcome: {e}");
                    }
                }
            })
            .await;

        if total > 0 {
            info!(processed = total, "pending items processed");
        }
        Ok(total)
    }

    /// Main loop. Scans every `scan_interval_secs` (or when woken) until
    /// `shutdown` broadcasts `true`, then waits for running workers.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let Some(rx) = self.rx.take() else {
            warn!("scheduler engine already started");
            return;
        };
        let pool = WorkerPool::new(
            rx,
            self.worker.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.concurrency,
        );
        let pool_task = tokio::spawn(pool.run(shutdown.clone()));

        info!(
            interval_secs = self.interval.as_secs(),
            batch = self.batch,
            "scheduler engine started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.scan_logged(),
                _ = self.wake.notified() => self.scan_logged(),
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(e) = pool_task.await {
            error!("worker pool task failed: {e}");
        }
        info!("scheduler engine stopped");
    }

    /// Return abandoned claims to the retry path before claiming new work.
    fn reap(&self, now: chrono::DateTime<chrono::Utc>) {
        match self
            .store
            .reap_expired(now, self.lease, &self.policy, self.batch)
        {
            Ok(0) => {}
            Ok(n) => warn!(recovered = n, "recovered expired claims"),
            Err(e) => error!("expired claim sweep failed: {e}"),
        }
    }

    fn scan_logged(&self) {
        if let Err(e) = self.scan_once() {
            error!("scheduler scan error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        publisher::{PublishError, PublishReceipt, PublishRequest, Publisher},
        types::ItemStatus,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    struct AlwaysOk;

    #[async_trait]
    impl Publisher for AlwaysOk {
        fn name(&self) -> &str {
            "always-ok"
        }

        async fn publish(&self, _req: &PublishRequest) -> std::result::Result<PublishReceipt, PublishError> {
            Ok(PublishReceipt::default())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 6, 0, 0).unwrap()
    }

    fn engine_at(path: &std::path::Path, clock: Arc<dyn Clock>) -> SchedulerEngine {
        let mut reg = PublisherRegistry::new();
        reg.register("a", Arc::new(AlwaysOk));
        let conn = crate::db::open(path, Duration::from_secs(5)).unwrap();
        SchedulerEngine::with_clock(conn, reg, &SchedulerConfig::default(), clock).unwrap()
    }

    #[tokio::test]
    async fn scan_once_queues_only_due_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(t0()));
        let engine = engine_at(&path, clock);
        let handle = engine.handle(crate::db::open(&path, Duration::from_secs(5)).unwrap()).unwrap();

        let due = handle.create(NewItem::one_shot("o", "now", &["a"], t0())).unwrap();
        let later = handle
            .create(NewItem::one_shot("o", "later", &["a"], t0() + chrono::Duration::hours(1)))
            .unwrap();

        assert_eq!(engine.scan_once().unwrap(), 1);
        assert_eq!(handle.get(&due.id).unwrap().status, ItemStatus::InFlight);
        assert_eq!(handle.get(&later.id).unwrap().status, ItemStatus::Pending);
        // already claimed: a second scan finds nothing
        assert_eq!(engine.scan_once().unwrap(), 0);
    }

    #[tokio::test]
    async fn scan_recovers_claim_abandoned_in_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine_at(&path, clock.clone());
        let handle = engine.handle(crate::db::open(&path, Duration::from_secs(5)).unwrap()).unwrap();
        let item = handle.create(NewItem::one_shot("o", "stuck", &["a"], t0())).unwrap();

        // queued, but no worker pool is running to pick it up
        assert_eq!(engine.scan_once().unwrap(), 1);
        clock.advance(chrono::Duration::minutes(9));
        assert_eq!(engine.scan_once().unwrap(), 0);
        assert_eq!(handle.get(&item.id).unwrap().status, ItemStatus::InFlight);

        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(engine.scan_once().unwrap(), 0);
        let recovered = handle.get(&item.id).unwrap();
        assert_eq!(recovered.status, ItemStatus::Pending);
        assert_eq!(recovered.attempt_count, 1);

        clock.advance(chrono::Duration::minutes(1));
        assert_eq!(engine.run_pending().await.unwrap(), 1);
        assert_eq!(handle.get(&item.id).unwrap().status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn run_publishes_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        let engine = engine_at(&path, Arc::new(SystemClock));
        let handle = engine.handle(crate::db::open(&path, Duration::from_secs(5)).unwrap()).unwrap();
        let item = handle
            .create(NewItem::one_shot("o", "hello", &["a"], Utc::now()))
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(rx));

        let mut status = ItemStatus::Pending;
        for _ in 0..100 {
            status = handle.get(&item.id).unwrap().status;
            if status == ItemStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, ItemStatus::Completed);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn send_now_publishes_future_item() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        let engine = engine_at(&path, Arc::new(SystemClock));
        let handle = engine.handle(crate::db::open(&path, Duration::from_secs(5)).unwrap()).unwrap();
        let item = handle
            .create(NewItem::one_shot(
                "o",
                "tomorrow",
                &["a"],
                Utc::now() + chrono::Duration::days(1),
            ))
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(rx));

        let sent = handle.send_now(&item.id).unwrap();
        assert_eq!(sent.status, ItemStatus::InFlight);

        let mut status = ItemStatus::InFlight;
        for _ in 0..100 {
            status = handle.get(&item.id).unwrap().status;
            if status == ItemStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, ItemStatus::Completed);

        tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
}
