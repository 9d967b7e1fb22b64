//! Account-related types for the ledger
//!
//! This module defines the Account structure held by the account store.

use super::economable::Economable;
use rust_decimal::Decimal;

/// Logical modification stamp
///
/// Stamps come from a single monotonic counter per account store, so every
/// account's mutation history is totally ordered by its stamps.
pub type Sequence = u64;

/// Cached account state
///
/// Represents the in-memory view of one economable's balance together with
/// the bookkeeping needed to flush it and to reconcile remote reloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    /// The economable this account belongs to
    pub economable: Economable,

    /// Current balance, in currency units at the configured precision
    pub balance: Decimal,

    /// Whether the balance differs from the last value known to be durable
    ///
    /// Set by every local mutation and cleared only after the write flusher
    /// has persisted the exact stamp it observed.
    pub dirty: bool,

    /// Stamp of the last local mutation or reload that produced `balance`
    ///
    /// Zero means the account was never mutated or reloaded in this process.
    pub last_modified: Sequence,

    /// Stamp taken when this process last confirmed `balance` durable
    ///
    /// A reload that started before this stamp may have read the store before
    /// that write landed, so it must not replace the balance.
    pub persisted_at: Sequence,
}

impl Account {
    /// Create a new account with a zero balance
    ///
    /// # Arguments
    ///
    /// * `economable` - The economable this account belongs to
    ///
    /// # Returns
    ///
    /// A clean account with balance = 0 and last_modified = 0
    pub fn new(economable: Economable) -> Self {
        Self::with_balance(economable, Decimal::ZERO)
    }

    /// Create a clean account holding a balance loaded from durable storage
    pub fn with_balance(economable: Economable, balance: Decimal) -> Self {
        Account {
            economable,
            balance,
            dirty: false,
            last_modified: 0,
            persisted_at: 0,
        }
    }
}
