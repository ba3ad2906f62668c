//! Hand-off between the scanner and the publish workers.
//!
//! The scanner never waits on a worker: [`Dispatcher::dispatch`] is a
//! non-blocking `try_send` onto a bounded queue. When the queue is full or
//! closed the claim is released so the item is picked up by a later scan.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    store::ItemStore,
    types::ClaimedItem,
    worker::PublishWorker,
};

#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<ClaimedItem>,
    store: ItemStore,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Create a dispatcher and the queue receiver its worker pool consumes.
    pub fn channel(
        store: ItemStore,
        clock: Arc<dyn Clock>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ClaimedItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, store, clock }, rx)
    }

    /// Queue a claimed item for execution.
    pub fn dispatch(&self, claim: ClaimedItem) -> Result<()> {
        let id = claim.item.id.clone();
        match self.tx.try_send(claim) {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = match &e {
                    mpsc::error::TrySendError::Full(_) => "worker queue full",
                    mpsc::error::TrySendError::Closed(_) => "worker pool stopped",
                };
                let claim = e.into_inner();
                if let Err(release_err) = self.store.release(&claim, self.clock.now()) {
                    error!(item_id = %id, "failed to release undispatched claim: {release_err}");
                }
                warn!(item_id = %id, reason, "dispatch failed; claim released");
                Err(SchedulerError::Dispatch(reason.to_string()))
            }
        }
    }
}

/// Consumes the dispatch queue, running at most `concurrency` workers at once.
pub struct WorkerPool {
    rx: mpsc::Receiver<ClaimedItem>,
    worker: PublishWorker,
    store: ItemStore,
    clock: Arc<dyn Clock>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(
        rx: mpsc::Receiver<ClaimedItem>,
        worker: PublishWorker,
        store: ItemStore,
        clock: Arc<dyn Clock>,
        concurrency: usize,
    ) -> Self {
        Self {
            rx,
            worker,
            store,
            clock,
            concurrency: concurrency.max(1),
        }
    }

    /// Run until `shutdown` flips to `true` or every dispatcher is dropped.
    ///
    /// On shutdown, claims still sitting in the queue are released and running
    /// workers are allowed to finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(concurrency = self.concurrency, "worker pool started");
        let permits = Arc::new(Semaphore::new(self.concurrency));

        loop {
            tokio::select! {
                next = self.rx.recv() => {
                    let Some(claim) = next else { break };
                    let Ok(permit) = permits.clone().acquire_owned().await else { break };
                    let worker = self.worker.clone();
                    tokio::spawn(async move {
                        let id = claim.item.id.clone();
                        if let Err(e) = worker.execute(claim).await {
                            error!(item_id = %id, "worker failed to apply outcome: {e}");
                        }
                        drop(permit);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("worker pool shutting down");
                        break;
                    }
                }
            }
        }

        self.rx.close();
        while let Ok(claim) = self.rx.try_recv() {
            if let Err(e) = self.store.release(&claim, self.clock.now()) {
                error!(item_id = %claim.item.id, "failed to release queued claim: {e}");
            }
        }

        let total = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        let _ = permits.acquire_many(total).await;
        info!("worker pool stopped");
    }
}
