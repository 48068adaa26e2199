//! Reconciliation Controller
//!
//! Level-triggered control loop. Changes enqueue the affected request; a
//! bounded pool of workers drains the queue, each tick running to completion
//! unless the request is deleted mid-flight. A resync ticker re-enqueues every
//! request periodically so settled requests are revisited.

pub mod backoff;
pub mod diff;
pub mod queue;
pub mod reconcile;

use crate::config::ControllerConfig;
use crate::models::RequestKey;
use crate::store::RequestStore;
use backoff::Backoff;
use queue::WorkQueue;
use reconcile::{Reconciler, TickOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use reconcile::ReconcileConfig;

pub struct Controller {
    queue: Arc<WorkQueue>,
    store: RequestStore,
    reconciler: Arc<Reconciler>,
    config: ControllerConfig,
    /// Consecutive failed ticks per request, for error backoff
    failures: Mutex<HashMap<RequestKey, u32>>,
    shutdown: watch::Sender<bool>,
}

enum TickResult {
    Finished(crate::error::ControlResult<TickOutcome>),
    Cancelled,
}

impl Controller {
    pub fn new(store: RequestStore, reconciler: Reconciler, config: ControllerConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            queue: Arc::new(WorkQueue::new()),
            store,
            reconciler: Arc::new(reconciler),
            config,
            failures: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// Spawn the worker pool and the resync ticker
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let workers = self.config.workers.max(1);
        let mut handles = Vec::with_capacity(workers + 1);

        for id in 0..workers {
            let controller = Arc::clone(self);
            handles.push(tokio::spawn(async move { controller.run_worker(id).await }));
        }

        let controller = Arc::clone(self);
        handles.push(tokio::spawn(async move { controller.run_resync().await }));

        info!(workers, resync_ms = self.config.resync_interval.as_millis() as u64, "Controller started");
        handles
    }

    pub async fn enqueue(&self, key: RequestKey) {
        self.queue.add(key).await;
    }

    /// Mark every decision snapshot stale and reconcile every request
    pub async fn refresh_decisions(&self) -> usize {
        let keys = self.store.invalidate_decisions().await;
        let count = keys.len();
        for key in keys {
            self.queue.add(key).await;
        }
        info!(requests = count, "Decision refresh requested");
        count
    }

    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.queue.shutdown().await;
        info!("Controller stopping");
    }

    async fn run_worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "Worker started");
        while let Some(key) = self.queue.next().await {
            let span = info_span!("reconcile", request = %key, worker = id);
            let result = self.tick(&key).instrument(span.clone()).await;
            self.queue.done(&key).await;
            self.handle_result(key, result).instrument(span).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    /// Run one reconcile, abandoning it if the request is deleted meanwhile.
    /// Releases are noted in the store before each deploy call, so an
    /// abandoned tick leaves nothing the finalizer cannot find.
    async fn tick(&self, key: &RequestKey) -> TickResult {
        let cancel = self.store.cancellation(key).await;
        match cancel {
            Some(mut cancel) if !*cancel.borrow() => {
                let deleted = async move {
                    let _ = cancel.wait_for(|deleted| *deleted).await;
                };
                tokio::select! {
                    result = self.reconciler.reconcile(key) => TickResult::Finished(result),
                    _ = deleted => TickResult::Cancelled,
                }
            }
            _ => TickResult::Finished(self.reconciler.reconcile(key).await),
        }
    }

    async fn handle_result(&self, key: RequestKey, result: TickResult) {
        let backoff = Backoff::new(self.config.backoff_base, self.config.backoff_ceiling);
        match result {
            TickResult::Cancelled => {
                info!("In-flight reconcile cancelled by deletion");
                self.queue.add(key).await;
            }
            TickResult::Finished(Ok(outcome)) => {
                self.failures.lock().await.remove(&key);
                match outcome {
                    TickOutcome::Requeue(delay) => {
                        debug!(delay_ms = delay.as_millis() as u64, "Requeue");
                        self.queue.add_after(key, delay);
                    }
                    TickOutcome::Settled | TickOutcome::Removed => {}
                }
            }
            TickResult::Finished(Err(e)) if e.is_retryable() => {
                let attempts = {
                    let mut failures = self.failures.lock().await;
                    let n = failures.entry(key.clone()).or_insert(0);
                    *n = n.saturating_add(1);
                    *n
                };
                let delay = backoff.delay(attempts);
                warn!(attempts, delay_ms = delay.as_millis() as u64, "Reconcile failed: {}", e);
                self.queue.add_after(key, delay);
            }
            TickResult::Finished(Err(e)) => {
                self.failures.lock().await.remove(&key);
                error!(reason = e.reason(), "Reconcile failed permanently: {}", e);
            }
        }
    }

    async fn run_resync(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let keys = self.store.keys().await;
                    debug!(requests = keys.len(), "Resync");
                    for key in keys {
                        self.queue.add(key).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
