//! Thread-safe, cache-first account store
//!
//! This module provides the `AccountStore` struct, the single source of truth
//! for balance reads. Accounts are materialized lazily from the durable
//! backend on first reference and cached for the lifetime of the store.
//!
//! # Design
//!
//! The store uses `DashMap` for fine-grained locking, so operations on
//! different economables never block each other while operations on the same
//! economable are serialized by the entry lock. No backend I/O ever happens
//! while an entry lock is held.
//!
//! # Reload ordering
//!
//! Every mutation and every reload takes a stamp from one monotonic counter.
//! A reload takes its stamp *before* reading the backend and only overwrites
//! the cached account if no local mutation stamped it later in the meantime,
//! so a stale remote reload can never clobber a newer local write.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::traits::DurableBackend;
use crate::types::{Account, Economable, LedgerError, Sequence, StorageError};

/// How a completed write left the account it wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The written balance is current; the account is clean
    Clean,
    /// A newer local mutation happened; the account stays dirty
    Superseded,
    /// A reload replaced the balance mid-write; the account is dirty again
    Reloaded,
}

/// Cache of account state in front of a durable backend
#[derive(Debug)]
pub struct AccountStore {
    /// Cached accounts by economable
    accounts: DashMap<Economable, Account>,

    /// Backend consulted on cache misses and reloads
    backend: Arc<dyn DurableBackend>,

    /// Source of `last_modified` stamps
    sequence: AtomicU64,
}

impl AccountStore {
    /// Create an empty store in front of `backend`
    pub fn new(backend: Arc<dyn DurableBackend>) -> Self {
        Self {
            accounts: DashMap::new(),
            backend,
            sequence: AtomicU64::new(0),
        }
    }

    /// Seed the cache with accounts from a bulk load
    ///
    /// Accounts already cached are left untouched.
    pub fn preload(&self, accounts: Vec<Account>) {
        for account in accounts {
            self.accounts
                .entry(account.economable.clone())
                .or_insert(account);
        }
    }

    /// Get an account, materializing it on first reference
    ///
    /// On a cache miss the backend is queried synchronously. An economable the
    /// backend has never seen starts with a zero balance.
    ///
    /// # Returns
    ///
    /// A clone of the account. It is a snapshot; concurrent mutations after
    /// the call are not reflected in it.
    pub fn get(&self, economable: &Economable) -> Result<Account, StorageError> {
        if let Some(account) = self.accounts.get(economable) {
            return Ok(account.value().clone());
        }

        let loaded = self
            .backend
            .load_one(economable)?
            .unwrap_or_else(|| Account::new(economable.clone()));

        // Another thread may have materialized it while we were loading
        let entry = self.accounts.entry(economable.clone()).or_insert(loaded);
        Ok(entry.value().clone())
    }

    /// Whether the economable is currently cached
    pub fn contains(&self, economable: &Economable) -> bool {
        self.accounts.contains_key(economable)
    }

    /// Atomically read-modify-write a balance
    ///
    /// The closure receives the current balance and may change it or reject
    /// the update. On success the account is marked dirty and stamped.
    ///
    /// # Returns
    ///
    /// * `Ok(Account)` - The account state right after the update
    /// * `Err(LedgerError)` - The closure's error, or a storage error from
    ///   materializing the account; nothing is changed in either case
    pub fn update<F>(&self, economable: &Economable, f: F) -> Result<Account, LedgerError>
    where
        F: FnOnce(&mut Decimal) -> Result<(), LedgerError>,
    {
        // Materialize outside the entry lock so backend I/O never holds it
        self.get(economable)?;

        let mut entry = self
            .accounts
            .entry(economable.clone())
            .or_insert_with(|| Account::new(economable.clone()));
        let account = entry.value_mut();

        let mut balance = account.balance;
        f(&mut balance)?;

        account.balance = balance;
        account.dirty = true;
        account.last_modified = self.next_sequence();

        Ok(account.clone())
    }

    /// Add `delta` (which may be negative) to a balance
    ///
    /// Unless `allow_overdraft` is set, an update that would leave the
    /// balance below zero is rejected with `InsufficientFunds`.
    pub fn apply(
        &self,
        economable: &Economable,
        delta: Decimal,
        allow_overdraft: bool,
    ) -> Result<Account, LedgerError> {
        self.apply_within(economable, delta, allow_overdraft, Decimal::MAX)
    }

    /// Like [`apply`](Self::apply), but the resulting balance must also stay
    /// within `-limit..=limit`
    ///
    /// A result outside the range is rejected with `ArithmeticOverflow`.
    pub fn apply_within(
        &self,
        economable: &Economable,
        delta: Decimal,
        allow_overdraft: bool,
        limit: Decimal,
    ) -> Result<Account, LedgerError> {
        self.update(economable, |balance| {
            let next = balance
                .checked_add(delta)
                .filter(|next| next.abs() <= limit)
                .ok_or_else(|| LedgerError::arithmetic_overflow("apply", economable))?;

            if next < Decimal::ZERO && !allow_overdraft {
                return Err(LedgerError::insufficient_funds(economable, *balance, -delta));
            }

            *balance = next;
            Ok(())
        })
    }

    /// Discard the cached balance and re-read it from the backend
    ///
    /// Used when another process signals that its copy changed. Economables
    /// that are not cached are left alone; their next `get` reads the backend
    /// anyway. If a local mutation stamped the account after this reload
    /// started, the local value is kept. The same holds when a write of the
    /// local balance was confirmed after the reload started: the read may
    /// predate that write, and the store now holds the local value.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(Account))` - The account state after reconciliation
    /// * `Ok(None)` - The economable was not cached
    pub fn force_reload(&self, economable: &Economable) -> Result<Option<Account>, StorageError> {
        if !self.contains(economable) {
            debug!(%economable, "reload skipped, account not cached");
            return Ok(None);
        }

        let stamp = self.next_sequence();
        let balance = self
            .backend
            .load_one(economable)?
            .map(|account| account.balance)
            .unwrap_or(Decimal::ZERO);

        let mut entry = self
            .accounts
            .entry(economable.clone())
            .or_insert_with(|| Account::new(economable.clone()));
        let account = entry.value_mut();

        if account.last_modified > stamp {
            debug!(
                %economable,
                local = account.last_modified,
                reload = stamp,
                "reload lost to a newer local mutation"
            );
            return Ok(Some(account.clone()));
        }
        if account.persisted_at > stamp {
            debug!(
                %economable,
                persisted = account.persisted_at,
                reload = stamp,
                "reload overlapped a local write, keeping the written balance"
            );
            return Ok(Some(account.clone()));
        }

        account.balance = balance;
        account.dirty = false;
        account.last_modified = stamp;
        debug!(%economable, %balance, "account reloaded from backend");

        Ok(Some(account.clone()))
    }

    /// Balance and stamp of a dirty account, or `None` if it is clean
    pub fn dirty_snapshot(&self, economable: &Economable) -> Option<(Decimal, Sequence)> {
        self.accounts.get(economable).and_then(|account| {
            account
                .dirty
                .then_some((account.balance, account.last_modified))
        })
    }

    /// Record that the balance observed at `stamp` was written
    ///
    /// Clears the dirty flag only if the account still carries `stamp`. If a
    /// reload replaced the balance while the write was in flight, that write
    /// overwrote the reloaded value in the store, so the account is marked
    /// dirty again and the reloaded balance must be written back.
    pub fn settle_write(&self, economable: &Economable, stamp: Sequence) -> WriteOutcome {
        let Some(mut account) = self.accounts.get_mut(economable) else {
            return WriteOutcome::Superseded;
        };

        if account.last_modified == stamp {
            account.dirty = false;
            account.persisted_at = self.next_sequence();
            WriteOutcome::Clean
        } else if account.dirty {
            WriteOutcome::Superseded
        } else {
            account.dirty = true;
            WriteOutcome::Reloaded
        }
    }

    /// Economables whose balance has not been confirmed durable
    pub fn dirty_economables(&self) -> Vec<Economable> {
        self.accounts
            .iter()
            .filter(|entry| entry.value().dirty)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Snapshot of every cached account, in arbitrary order
    pub fn all_accounts(&self) -> Vec<Account> {
        self.accounts
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    fn next_sequence(&self) -> Sequence {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn red() -> Economable {
        Economable::faction("red").unwrap()
    }

    fn store_with(backend: &Arc<MemoryBackend>) -> AccountStore {
        AccountStore::new(Arc::clone(backend) as Arc<dyn DurableBackend>)
    }

    #[test]
    fn test_get_materializes_zero_balance_when_absent() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);

        let account = store.get(&red()).unwrap();

        assert_eq!(account.balance, Decimal::ZERO);
        assert!(!account.dirty);
        assert_eq!(account.last_modified, 0);
        assert!(store.contains(&red()));
    }

    #[test]
    fn test_get_loads_from_backend_once() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(&red(), Decimal::new(100, 0));
        let store = store_with(&backend);

        assert_eq!(store.get(&red()).unwrap().balance, Decimal::new(100, 0));

        // Later backend changes are not visible without a reload
        backend.seed(&red(), Decimal::new(5, 0));
        assert_eq!(store.get(&red()).unwrap().balance, Decimal::new(100, 0));
        assert_eq!(backend.load_count(), 1);
    }

    #[test]
    fn test_get_propagates_backend_failure() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_unavailable(true);
        let store = store_with(&backend);

        assert!(matches!(
            store.get(&red()),
            Err(StorageError::Unavailable { .. })
        ));
        assert!(!store.contains(&red()));
    }

    #[test]
    fn test_apply_marks_dirty_and_stamps() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);

        let first = store.apply(&red(), Decimal::new(10, 0), false).unwrap();
        let second = store.apply(&red(), Decimal::new(-4, 0), false).unwrap();

        assert_eq!(second.balance, Decimal::new(6, 0));
        assert!(second.dirty);
        assert!(second.last_modified > first.last_modified);
    }

    #[test]
    fn test_apply_rejects_negative_balance() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);
        store.apply(&red(), Decimal::new(10, 0), false).unwrap();
        let before = store.get(&red()).unwrap();

        let result = store.apply(&red(), Decimal::new(-11, 0), false);

        assert_eq!(
            result.unwrap_err(),
            LedgerError::insufficient_funds(&red(), Decimal::new(10, 0), Decimal::new(11, 0))
        );
        assert_eq!(store.get(&red()).unwrap(), before);
    }

    #[test]
    fn test_apply_allows_overdraft_when_permitted() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);

        let account = store.apply(&red(), Decimal::new(-3, 0), true).unwrap();

        assert_eq!(account.balance, Decimal::new(-3, 0));
    }

    #[test]
    fn test_force_reload_overwrites_cached_value() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);
        store.apply(&red(), Decimal::new(10, 0), false).unwrap();

        backend.seed(&red(), Decimal::new(42, 0));
        let reloaded = store.force_reload(&red()).unwrap().unwrap();

        assert_eq!(reloaded.balance, Decimal::new(42, 0));
        assert!(!reloaded.dirty);
        assert_eq!(store.get(&red()).unwrap().balance, Decimal::new(42, 0));
    }

    #[test]
    fn test_force_reload_skips_uncached_economable() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);

        assert_eq!(store.force_reload(&red()).unwrap(), None);
        assert_eq!(backend.load_count(), 0);
    }

    #[test]
    fn test_force_reload_keeps_newer_local_mutation() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);
        store.apply(&red(), Decimal::new(10, 0), false).unwrap();
        backend.seed(&red(), Decimal::new(99, 0));

        // A local write stamped after the reload started must win
        let store = Arc::new(store);
        let racing = Arc::clone(&store);
        backend.on_next_load(move || {
            racing.apply(&red(), Decimal::new(5, 0), false).unwrap();
        });

        let reloaded = store.force_reload(&red()).unwrap().unwrap();

        assert_eq!(reloaded.balance, Decimal::new(15, 0));
        assert!(reloaded.dirty);
    }

    #[test]
    fn test_settle_write_requires_matching_stamp() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);
        let account = store.apply(&red(), Decimal::new(10, 0), false).unwrap();
        store.apply(&red(), Decimal::new(1, 0), false).unwrap();

        assert_eq!(
            store.settle_write(&red(), account.last_modified),
            WriteOutcome::Superseded
        );
        assert_eq!(store.dirty_economables(), vec![red()]);

        let (_, stamp) = store.dirty_snapshot(&red()).unwrap();
        assert_eq!(store.settle_write(&red(), stamp), WriteOutcome::Clean);
        assert!(store.dirty_snapshot(&red()).is_none());
    }

    #[test]
    fn test_write_overlapped_by_reload_marks_reloaded_value_dirty() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);
        store.apply(&red(), Decimal::new(10, 0), false).unwrap();
        let (_, stamp) = store.dirty_snapshot(&red()).unwrap();

        // Another server's value arrives while the write of 10 is in flight
        backend.seed(&red(), Decimal::new(50, 0));
        store.force_reload(&red()).unwrap();

        assert_eq!(store.settle_write(&red(), stamp), WriteOutcome::Reloaded);
        assert_eq!(
            store.dirty_snapshot(&red()).map(|(balance, _)| balance),
            Some(Decimal::new(50, 0))
        );
    }

    #[test]
    fn test_reload_overlapping_confirmed_write_keeps_written_balance() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(store_with(&backend));
        store.apply(&red(), Decimal::new(10, 0), false).unwrap();
        let (_, stamp) = store.dirty_snapshot(&red()).unwrap();
        backend.seed(&red(), Decimal::new(50, 0));

        // The write of 10 is confirmed after the reload took its stamp
        let racing = Arc::clone(&store);
        backend.on_next_load(move || {
            assert_eq!(racing.settle_write(&red(), stamp), WriteOutcome::Clean);
        });

        let reloaded = store.force_reload(&red()).unwrap().unwrap();

        assert_eq!(reloaded.balance, Decimal::new(10, 0));
        assert!(!reloaded.dirty);
    }

    #[test]
    fn test_apply_within_rejects_balances_beyond_limit() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);
        let limit = Decimal::new(100, 0);
        store.apply_within(&red(), limit, false, limit).unwrap();

        let result = store.apply_within(&red(), Decimal::ONE, false, limit);

        assert!(matches!(result, Err(LedgerError::ArithmeticOverflow { .. })));
        assert_eq!(store.get(&red()).unwrap().balance, limit);
    }

    #[test]
    fn test_preload_does_not_overwrite_cached_accounts() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(&backend);
        store.apply(&red(), Decimal::new(7, 0), false).unwrap();

        store.preload(vec![Account::with_balance(red(), Decimal::new(1, 0))]);

        assert_eq!(store.get(&red()).unwrap().balance, Decimal::new(7, 0));
        assert_eq!(store.len(), 1);
    }
}
