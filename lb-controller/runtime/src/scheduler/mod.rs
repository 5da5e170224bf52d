//! A bounded worker pool that runs reconcile passes for one resource kind.
//!
//! Keys are serialized: a key is never reconciled by two workers at once. A
//! key enqueued while its pass is running is re-run once that pass finishes,
//! and a key enqueued while already waiting is coalesced. Failed passes are
//! retried with exponential backoff; enqueueing a key supersedes its pending
//! retry.

use crate::metrics::{KindMetrics, Outcome, ReconcileMetrics};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use lb_controller_core::Error;
use parking_lot::Mutex;
use std::{fmt, hash::Hash, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinSet,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;


pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs one reconcile pass for a key.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static;

    async fn reconcile(&self, key: &Self::Key, cancel: CancellationToken) -> Result<(), Error>;
}

/// Retry delays for failed passes: `base` doubling per consecutive failure,
/// capped at `max`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

/// Enqueues keys for reconciliation.
pub struct Queue<K> {
    state: Arc<Mutex<State<K>>>,
    tx: mpsc::UnboundedSender<K>,
}

pub struct Scheduler<R: Reconcile> {
    reconciler: Arc<R>,
    kind: &'static str,
    max_concurrent: usize,
    timeout: Duration,
    backoff: Backoff,
    metrics: Option<KindMetrics>,
    queue: Queue<R::Key>,
    rx: mpsc::UnboundedReceiver<R::Key>,
}

struct State<K> {
    queued: HashSet<K>,
    in_flight: HashSet<K>,
    dirty: HashSet<K>,
    failures: HashMap<K, u32>,
    /// The generation of each key's pending retry timer.
    retries: HashMap<K, u64>,
    next_retry: u64,
}

/// Shared by every pass a scheduler spawns.
struct Worker<R: Reconcile> {
    reconciler: Arc<R>,
    kind: &'static str,
    timeout: Duration,
    backoff: Backoff,
    metrics: Option<KindMetrics>,
    queue: Queue<R::Key>,
    shutdown: CancellationToken,
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl Backoff {
    /// The delay before retrying after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

// === impl Queue ===

impl<K> Clone for Queue<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<K: Clone + Eq + Hash> Queue<K> {
    /// Schedules a pass for `key`.
    ///
    /// Returns false if the key was already waiting. A key whose pass is
    /// running is marked to run again afterwards.
    pub fn enqueue(&self, key: K) -> bool {
        let mut state = self.state.lock();
        state.retries.remove(&key);
        self.enqueue_locked(&mut state, key)
    }

    /// Drops the pending retry and failure count of a key that no longer
    /// exists.
    pub fn forget(&self, key: &K) {
        let mut state = self.state.lock();
        state.retries.remove(key);
        state.failures.remove(key);
        state.dirty.remove(key);
    }

    fn enqueue_locked(&self, state: &mut State<K>, key: K) -> bool {
        if state.in_flight.contains(&key) {
            return state.dirty.insert(key);
        }
        if !state.queued.insert(key.clone()) {
            return false;
        }
        // The receiver lives as long as the scheduler; once it is gone there
        // is nothing left to run the key.
        if self.tx.send(key.clone()).is_err() {
            state.queued.remove(&key);
            return false;
        }
        true
    }

    /// Registers a retry timer for `key`, replacing any earlier one.
    fn schedule_retry(&self, key: &K) -> u64 {
        let mut state = self.state.lock();
        state.next_retry += 1;
        let generation = state.next_retry;
        state.retries.insert(key.clone(), generation);
        generation
    }

    /// Enqueues `key` if the timer with `generation` is still its pending
    /// retry.
    fn fire_retry(&self, key: K, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.retries.get(&key) != Some(&generation) {
            return false;
        }
        state.retries.remove(&key);
        self.enqueue_locked(&mut state, key)
    }

    /// The number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn start(&self, key: &K) {
        let mut state = self.state.lock();
        state.queued.remove(key);
        state.in_flight.insert(key.clone());
    }

    /// Marks the pass for `key` finished, returning whether it must run again
    /// right away.
    fn finish(&self, key: &K) -> bool {
        let mut state = self.state.lock();
        state.in_flight.remove(key);
        state.dirty.remove(key)
    }

    fn record_failure(&self, key: &K) -> u32 {
        let mut state = self.state.lock();
        let failures = state.failures.entry(key.clone()).or_default();
        *failures = failures.saturating_add(1);
        *failures
    }

    fn failures(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    fn reset_failures(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }
}

// === impl Scheduler ===

impl<R: Reconcile> Scheduler<R> {
    pub fn new(kind: &'static str, reconciler: R, max_concurrent: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = State {
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
            failures: HashMap::new(),
            retries: HashMap::new(),
            next_retry: 0,
        };
        Self {
            reconciler: Arc::new(reconciler),
            kind,
            max_concurrent: max_concurrent.max(1),
            timeout: DEFAULT_RECONCILE_TIMEOUT,
            backoff: Backoff::default(),
            metrics: None,
            queue: Queue {
                state: Arc::new(Mutex::new(state)),
                tx,
            },
            rx,
        }
    }

    /// Sets the deadline for each pass.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    pub fn with_metrics(self, metrics: &ReconcileMetrics) -> Self {
        let metrics = Some(metrics.kind(self.kind));
        Self { metrics, ..self }
    }

    pub fn queue(&self) -> Queue<R::Key> {
        self.queue.clone()
    }

    /// Processes keys until `shutdown` is cancelled, then cancels in-flight
    /// passes and waits for them to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            reconciler,
            kind,
            max_concurrent,
            timeout,
            backoff,
            metrics,
            queue,
            mut rx,
        } = self;

        let worker = Arc::new(Worker {
            reconciler,
            kind,
            timeout,
            backoff,
            metrics,
            queue: queue.clone(),
            shutdown: shutdown.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut passes = JoinSet::new();
        tracing::debug!(%kind, max_concurrent, "Starting scheduler");

        loop {
            let key = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(res) = passes.join_next(), if !passes.is_empty() => {
                    if let Err(error) = res {
                        tracing::error!(%kind, %error, "Reconcile task failed");
                    }
                    continue;
                }
                key = rx.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            queue.start(&key);
            let span = tracing::info_span!("reconcile", %kind, %key);
            let worker = worker.clone();
            passes.spawn(
                async move {
                    worker.process(key).await;
                    drop(permit);
                }
                .instrument(span),
            );
        }

        tracing::debug!(%kind, in_flight = passes.len(), "Shutting down");
        while let Some(res) = passes.join_next().await {
            if let Err(error) = res {
                tracing::error!(%kind, %error, "Reconcile task failed");
            }
        }
    }
}

// === impl Worker ===

impl<R: Reconcile> Worker<R> {
    async fn process(&self, key: R::Key) {
        let started = time::Instant::now();
        let cancel = self.shutdown.child_token();
        let result = match time::timeout(
            self.timeout,
            self.reconciler.reconcile(&key, cancel.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                tracing::info!(timeout = ?self.timeout, "Reconcile deadline exceeded");
                Err(Error::Cancelled)
            }
        };

        let outcome = match &result {
            Ok(()) => Outcome::Success,
            Err(error) if error.is_cancelled() => Outcome::Cancelled,
            Err(_) => Outcome::Failure,
        };
        if let Some(metrics) = &self.metrics {
            metrics.record(outcome, started.elapsed());
        }

        let retry = match result {
            Ok(()) => {
                tracing::debug!(elapsed = ?started.elapsed(), "Reconciled");
                self.queue.reset_failures(&key);
                None
            }
            Err(error) if error.is_cancelled() => {
                tracing::debug!("Reconcile cancelled");
                if self.shutdown.is_cancelled() {
                    None
                } else {
                    // A pass cut short by its deadline is retried without
                    // counting as a failure.
                    Some(self.backoff.delay(self.queue.failures(&key).max(1)))
                }
            }
            Err(error) => {
                let failures = self.queue.record_failure(&key);
                let delay = self.backoff.delay(failures);
                tracing::warn!(%error, failures, retry_in = ?delay, "Reconcile failed");
                Some(delay)
            }
        };

        if self.queue.finish(&key) {
            self.queue.enqueue(key);
        } else if let Some(delay) = retry {
            self.requeue_after(key, delay);
        }
    }

    fn requeue_after(&self, key: R::Key, delay: Duration) {
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        let generation = queue.schedule_retry(&key);
        tokio::spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {}
                    _ = time::sleep(delay) => {
                        if !queue.fire_retry(key, generation) {
                            tracing::trace!("Retry superseded");
                        }
                    }
                }
            }
            .in_current_span(),
        );
    }
}
