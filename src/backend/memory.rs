//! Process-local durable backend
//!
//! Keeps balances in a map. Nothing survives the process, but one instance
//! can be shared by several ledgers to stand in for a store that several
//! servers write to. The backend counts loads and writes and can be told to
//! fail, which makes it the backend of choice for exercising flush and
//! reload behaviour.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::DurableBackend;
use crate::types::{Account, Economable, StorageError};

type Hook = Box<dyn FnOnce() + Send>;

/// In-memory backend with failure injection
#[derive(Default)]
pub struct MemoryBackend {
    balances: Mutex<BTreeMap<Economable, Decimal>>,
    unavailable: AtomicBool,
    failing_writes: AtomicU32,
    closed: AtomicBool,
    writes: AtomicU64,
    loads: AtomicU64,
    load_hook: Mutex<Option<Hook>>,
    write_hook: Mutex<Option<Hook>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a balance directly, as another process writing the store would
    pub fn seed(&self, economable: &Economable, balance: Decimal) {
        self.balances().insert(economable.clone(), balance);
    }

    /// The stored balance, bypassing failure injection and counters
    pub fn stored_balance(&self, economable: &Economable) -> Option<Decimal> {
        self.balances().get(economable).copied()
    }

    /// Number of balances written through `persist`/`persist_batch`
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `load_one` calls served
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Make every operation fail with a transient `Unavailable` error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` write calls with a transient error
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Run `hook` once, in the middle of the next `load_one`
    ///
    /// The hook runs after the call started and before the stored balance is
    /// read, which lets callers interleave work with a reload.
    pub fn on_next_load(&self, hook: impl FnOnce() + Send + 'static) {
        *lock(&self.load_hook) = Some(Box::new(hook));
    }

    /// Run `hook` once, in the middle of the next successful write
    ///
    /// The hook runs after the write was accepted and before any balance is
    /// stored.
    pub fn on_next_write(&self, hook: impl FnOnce() + Send + 'static) {
        *lock(&self.write_hook) = Some(Box::new(hook));
    }

    fn balances(&self) -> MutexGuard<'_, BTreeMap<Economable, Decimal>> {
        lock(&self.balances)
    }

    fn check_reachable(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("memory backend marked unavailable"));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        self.check_reachable()?;

        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StorageError::unavailable("injected write failure"));
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("accounts", &self.balances().len())
            .field("writes", &self.write_count())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl DurableBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load_all(&self) -> Result<Vec<Account>, StorageError> {
        self.check_reachable()?;

        Ok(self
            .balances()
            .iter()
            .map(|(economable, balance)| Account::with_balance(economable.clone(), *balance))
            .collect())
    }

    fn load_one(&self, economable: &Economable) -> Result<Option<Account>, StorageError> {
        self.check_reachable()?;
        self.loads.fetch_add(1, Ordering::SeqCst);

        let hook = lock(&self.load_hook).take();
        if let Some(hook) = hook {
            hook();
        }

        Ok(self
            .stored_balance(economable)
            .map(|balance| Account::with_balance(economable.clone(), balance)))
    }

    fn persist(&self, economable: &Economable, balance: Decimal) -> Result<(), StorageError> {
        self.persist_batch(&[(economable.clone(), balance)])
    }

    fn persist_batch(&self, batch: &[(Economable, Decimal)]) -> Result<(), StorageError> {
        self.check_writable()?;

        let hook = lock(&self.write_hook).take();
        if let Some(hook) = hook {
            hook();
        }

        let mut balances = self.balances();
        for (economable, balance) in batch {
            balances.insert(economable.clone(), *balance);
        }
        self.writes.fetch_add(batch.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn top_n(&self, n: usize) -> Result<Vec<(Economable, Decimal)>, StorageError> {
        self.check_reachable()?;

        let mut entries: Vec<(Economable, Decimal)> = self
            .balances()
            .iter()
            .map(|(economable, balance)| (economable.clone(), *balance))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        Ok(entries)
    }

    fn flush_and_wait(&self) -> Result<(), StorageError> {
        self.check_reachable()
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
