//! Core traits for storage, transaction subscribers and the sync relay
//!
//! These are the seams where the ledger meets things it does not own: the
//! storage engine, whoever wants to hear about transactions, the external
//! relay and the host's notion of which players are connected.

use bytes::Bytes;
use rust_decimal::Decimal;
use std::fmt;

use crate::types::{Account, Economable, RelayError, StorageError, Transaction};

/// Durable storage for account balances
///
/// Every storage engine implements the same capability set, so callers
/// never need to know which concrete backend they hold. All methods may
/// block on I/O; async callers run them on the blocking pool.
pub trait DurableBackend: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Load every stored account (startup bulk load)
    fn load_all(&self) -> Result<Vec<Account>, StorageError>;

    /// Load a single account, or `None` if it was never stored
    fn load_one(&self, economable: &Economable) -> Result<Option<Account>, StorageError>;

    /// Durably store one balance
    fn persist(&self, economable: &Economable, balance: Decimal) -> Result<(), StorageError>;

    /// Durably store several balances
    ///
    /// The default writes them one by one; engines that can group writes
    /// override this to apply the whole batch at once.
    fn persist_batch(&self, batch: &[(Economable, Decimal)]) -> Result<(), StorageError> {
        for (economable, balance) in batch {
            self.persist(economable, *balance)?;
        }
        Ok(())
    }

    /// The `n` highest balances, highest first
    fn top_n(&self, n: usize) -> Result<Vec<(Economable, Decimal)>, StorageError>;

    /// Block until every write accepted so far is durable
    fn flush_and_wait(&self) -> Result<(), StorageError>;

    /// Release resources; later calls fail with `StorageError::Closed`
    fn close(&self) -> Result<(), StorageError>;
}

/// Receiver of emitted transactions
///
/// Subscribers run synchronously on the caller's thread after a mutation was
/// applied, so they must be quick and must not call back into the engine.
pub trait TransactionSubscriber: Send + Sync {
    fn on_transaction(&self, transaction: &Transaction);
}

/// Receiver of accounts the write flusher has made durable
///
/// Called from the flusher's worker task with the economables whose current
/// balance is now in the backend.
pub trait PersistListener: Send + Sync {
    fn on_persisted(&self, economables: &[Economable]);
}

/// Answers whether an economable has a live session on this process
pub trait PresenceOracle: Send + Sync {
    fn is_present(&self, economable: &Economable) -> bool;
}

/// Outbound side of the external relay
///
/// Some relays can only send through a connected session. `has_carrier`
/// reports whether such a session exists right now; when it does not,
/// outbound invalidations are skipped.
pub trait RelayTransport: Send + Sync {
    fn has_carrier(&self) -> bool;

    fn send(&self, frame: Bytes) -> Result<(), RelayError>;
}

/// Presence oracle for hosts without sessions: nobody is ever present
#[derive(Debug, Clone, Copy, Default)]
pub struct NobodyPresent;

impl PresenceOracle for NobodyPresent {
    fn is_present(&self, _economable: &Economable) -> bool {
        false
    }
}
