//! Background writer from the account store to the durable backend
//!
//! Mutations only mark accounts dirty and enqueue their economable here; a
//! single worker task drains the queue in batches and hands each batch to the
//! backend on the blocking pool.
//!
//! # Coalescing
//!
//! An economable is queued at most once. Enqueuing it again before the worker
//! picks it up is a no-op, and the worker always writes the balance current at
//! the time it takes the batch, so any number of mutations between two flushes
//! produce one write. Because there is only one worker, an account never has
//! two writes in flight.
//!
//! # Failures
//!
//! Transient errors are retried with exponential backoff. A batch that fails
//! permanently is written again one account at a time, so a single balance
//! the backend rejects only fails its own account. Accounts that still fail
//! are reported through the next [`WriteFlusher::flush_and_wait`] and parked.
//! Parked accounts stay dirty in the store and are queued again by the next
//! `flush_and_wait` or [`WriteFlusher::retry_failed`].
//!
//! # Listeners
//!
//! [`PersistListener`]s are told about every account whose write left it
//! clean. They run on the worker task and must not block.

use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::account_store::{AccountStore, WriteOutcome};
use super::traits::{DurableBackend, PersistListener};
use crate::config::FlushConfig;
use crate::types::{Economable, FlushFailure, Sequence, StorageError};

/// Longest delay between two attempts of one batch
pub const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Outcome of the writes resolved since the previous report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Accounts confirmed durable and clean
    pub persisted: usize,

    /// Accounts that exhausted their attempts; they remain dirty
    pub failures: Vec<FlushFailure>,

    /// Error from the backend's own drain, if any
    pub backend_error: Option<StorageError>,
}

impl FlushReport {
    /// Whether everything was made durable
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.backend_error.is_none()
    }
}

type WriteResult = Result<u32, (u32, StorageError)>;

#[derive(Debug, Default)]
struct FlushQueue {
    order: VecDeque<Economable>,
    queued: HashSet<Economable>,
    in_flight: usize,
    parked: HashSet<Economable>,
    report: FlushReport,
}

impl FlushQueue {
    fn push(&mut self, economable: Economable) -> bool {
        if self.queued.insert(economable.clone()) {
            self.order.push_back(economable);
            true
        } else {
            false
        }
    }

    fn is_idle(&self) -> bool {
        self.order.is_empty() && self.in_flight == 0
    }
}

struct Shared {
    store: Arc<AccountStore>,
    backend: Arc<dyn DurableBackend>,
    config: FlushConfig,
    listeners: RwLock<Vec<Arc<dyn PersistListener>>>,
    queue: Mutex<FlushQueue>,
    /// Wakes the worker
    wake: Notify,
    /// Signalled whenever the queue drains
    idle: Notify,
    stopping: AtomicBool,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, FlushQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the next batch; `false` once the queue is empty
    async fn drain_batch(&self) -> bool {
        let keys: Vec<Economable> = {
            let mut queue = self.queue();
            if queue.order.is_empty() {
                let idle = queue.is_idle();
                drop(queue);
                if idle {
                    self.idle.notify_waiters();
                }
                return false;
            }

            let take = queue.order.len().min(self.config.batch_size);
            let keys: Vec<Economable> = queue.order.drain(..take).collect();
            for key in &keys {
                queue.queued.remove(key);
            }
            queue.in_flight += keys.len();
            keys
        };

        // Balances are read after dequeuing, so a later mutation re-queues
        let snapshot: Vec<(Economable, Decimal, Sequence)> = keys
            .iter()
            .filter_map(|key| {
                self.store
                    .dirty_snapshot(key)
                    .map(|(balance, stamp)| (key.clone(), balance, stamp))
            })
            .collect();

        let outcomes = self.persist_isolating(&snapshot).await;

        let mut failures = Vec::new();
        let mut persisted = Vec::new();
        let mut rewrite = Vec::new();
        for ((economable, _, stamp), outcome) in snapshot.into_iter().zip(outcomes) {
            match outcome {
                Ok(_) => match self.store.settle_write(&economable, stamp) {
                    WriteOutcome::Clean => persisted.push(economable),
                    WriteOutcome::Superseded => {
                        debug!(%economable, "account changed during flush, stays dirty");
                    }
                    WriteOutcome::Reloaded => {
                        debug!(%economable, "account reloaded during flush, writing it back");
                        rewrite.push(economable);
                    }
                },
                Err((attempts, error)) => {
                    warn!(%economable, attempts, %error, "flush failed, account parked");
                    failures.push(FlushFailure {
                        economable,
                        attempts,
                        error,
                    });
                }
            }
        }
        if !persisted.is_empty() {
            debug!(persisted = persisted.len(), "flush batch written");
            self.notify_persisted(&persisted);
        }

        let mut queue = self.queue();
        queue.report.persisted += persisted.len();
        for economable in &persisted {
            queue.parked.remove(economable);
        }
        for economable in rewrite {
            queue.push(economable);
        }
        for failure in failures {
            queue.parked.insert(failure.economable.clone());
            queue.report.failures.push(failure);
        }
        queue.in_flight -= keys.len();
        true
    }

    /// Persist a snapshot, one result per row
    ///
    /// The rows go to the backend as one batch. If that batch fails with a
    /// permanent error, each row is written on its own so only the rows the
    /// backend actually rejects fail.
    async fn persist_isolating(&self, snapshot: &[(Economable, Decimal, Sequence)]) -> Vec<WriteResult> {
        if snapshot.is_empty() {
            return Vec::new();
        }

        let rows = snapshot
            .iter()
            .map(|(economable, balance, _)| (economable.clone(), *balance))
            .collect();
        match self.persist_with_retry(rows).await {
            Ok(attempts) => vec![Ok(attempts); snapshot.len()],
            Err((attempts, error)) if error.is_transient() || snapshot.len() == 1 => {
                vec![Err((attempts, error)); snapshot.len()]
            }
            Err((_, error)) => {
                debug!(
                    accounts = snapshot.len(),
                    %error,
                    "batch rejected, writing accounts one at a time"
                );
                let mut outcomes = Vec::with_capacity(snapshot.len());
                for (economable, balance, _) in snapshot {
                    outcomes.push(self.persist_with_retry(vec![(economable.clone(), *balance)]).await);
                }
                outcomes
            }
        }
    }

    fn notify_persisted(&self, economables: &[Economable]) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_persisted(economables);
        }
    }

    /// Persist one batch, retrying transient errors
    ///
    /// # Returns
    ///
    /// * `Ok(attempts)` - The batch is durable
    /// * `Err((attempts, error))` - The last error once attempts ran out or
    ///   the error was not transient
    async fn persist_with_retry(&self, rows: Vec<(Economable, Decimal)>) -> WriteResult {
        let rows = Arc::new(rows);
        let mut delay = Duration::from_millis(self.config.backoff_ms);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let backend = Arc::clone(&self.backend);
            let batch = Arc::clone(&rows);
            let result = tokio::task::spawn_blocking(move || backend.persist_batch(&batch))
                .await
                .unwrap_or_else(|e| {
                    Err(StorageError::unavailable(format!("flush task failed: {}", e)))
                });

            match result {
                Ok(()) => return Ok(attempt),
                Err(error) if error.is_transient() && attempt < self.config.max_attempts => {
                    debug!(attempt, %error, ?delay, "transient flush error, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(error) => return Err((attempt, error)),
            }
        }
    }
}

/// Queue of dirty accounts and the worker that drains it
pub struct WriteFlusher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteFlusher {
    /// Spawn the worker on the current tokio runtime
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(
        store: Arc<AccountStore>,
        backend: Arc<dyn DurableBackend>,
        config: FlushConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            store,
            backend,
            config,
            listeners: RwLock::new(Vec::new()),
            queue: Mutex::new(FlushQueue::default()),
            wake: Notify::new(),
            idle: Notify::new(),
            stopping: AtomicBool::new(false),
        });

        let worker = tokio::spawn(run_worker(Arc::clone(&shared)));

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a listener for accounts made durable
    pub fn subscribe(&self, listener: Arc<dyn PersistListener>) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Queue an account for writing; a no-op if it is already queued
    pub fn enqueue(&self, economable: &Economable) {
        if self.shared.queue().push(economable.clone()) {
            self.shared.wake.notify_one();
        }
    }

    /// Queue every parked account again
    ///
    /// # Returns
    ///
    /// How many accounts were re-queued
    pub fn retry_failed(&self) -> usize {
        let requeued = {
            let mut queue = self.shared.queue();
            let parked: Vec<Economable> = queue.parked.drain().collect();
            parked
                .into_iter()
                .filter(|economable| queue.push(economable.clone()))
                .count()
        };

        if requeued > 0 {
            info!(requeued, "retrying parked flush failures");
            self.shared.wake.notify_one();
        }
        requeued
    }

    /// Accounts queued and not yet taken by the worker
    pub fn pending(&self) -> usize {
        self.shared.queue().order.len()
    }

    /// Accounts whose last flush failed
    pub fn parked(&self) -> usize {
        self.shared.queue().parked.len()
    }

    /// Drain every pending write and wait for it to resolve
    ///
    /// Every account dirty when this is called is queued, including parked
    /// ones. Returns once the queue is empty and nothing is in flight, then
    /// asks the backend to make its own buffered writes durable.
    ///
    /// # Returns
    ///
    /// The writes resolved since the previous report. Failures leave the
    /// in-memory balance untouched and the account dirty.
    pub async fn flush_and_wait(&self) -> FlushReport {
        self.retry_failed();
        for economable in self.shared.store.dirty_economables() {
            self.enqueue(&economable);
        }

        if self.worker_running() {
            loop {
                let mut idle = pin!(self.shared.idle.notified());
                idle.as_mut().enable();
                if self.shared.queue().is_idle() {
                    break;
                }
                self.shared.wake.notify_one();
                idle.await;
            }
        } else {
            while self.shared.drain_batch().await {}
        }

        let backend = Arc::clone(&self.shared.backend);
        let backend_error = tokio::task::spawn_blocking(move || backend.flush_and_wait())
            .await
            .unwrap_or_else(|e| Err(StorageError::unavailable(format!("flush task failed: {}", e))))
            .err();

        let mut report = std::mem::take(&mut self.shared.queue().report);
        report.backend_error = backend_error;

        for failure in &report.failures {
            warn!(%failure, "account could not be made durable");
        }
        if let Some(error) = &report.backend_error {
            warn!(%error, "backend drain failed");
        }
        info!(
            persisted = report.persisted,
            failed = report.failures.len(),
            "flush complete"
        );

        report
    }

    /// Flush everything, then stop the worker
    ///
    /// Later calls to `flush_and_wait` still work; they drain on the caller's
    /// task.
    pub async fn shutdown(&self) -> FlushReport {
        let report = self.flush_and_wait().await;

        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "flush worker ended abnormally");
            }
        }

        report
    }

    fn worker_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }
}

async fn run_worker(shared: Arc<Shared>) {
    debug!(backend = shared.backend.name(), "flush worker started");
    loop {
        while shared.drain_batch().await {}
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }
        shared.wake.notified().await;
    }
    debug!("flush worker stopped");
}
