//! Transaction processing engine
//!
//! This module provides the `TransactionEngine`, the only path through which
//! balances change. Every request goes through three steps:
//!
//! 1. **Validate** - the amount is positive and within currency precision, and
//!    a self transfer is allowed by policy
//! 2. **Apply** - the sender is debited (with its funds check under its own
//!    lock) and the receiver credited; if the credit fails the debit is
//!    compensated
//! 3. **Emit** - the touched accounts are queued for flushing and a
//!    `Transaction` is handed to each subscriber in registration order
//!
//! A rejected request changes nothing and emits nothing.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error};

use super::account_store::AccountStore;
use super::flusher::WriteFlusher;
use super::traits::TransactionSubscriber;
use crate::config::LedgerConfig;
use crate::types::{
    Economable, LedgerError, Party, Transaction, TransactionReason, TransactionRequest,
};

/// Rules applied to every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionPolicy {
    /// Let debits drive a balance below zero
    pub allow_overdraft: bool,
    /// Accept a transfer to oneself as a no-op instead of rejecting it
    pub allow_self_transfer: bool,
    /// Decimal places an amount may carry
    pub decimals: u32,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        TransactionPolicy {
            allow_overdraft: false,
            allow_self_transfer: false,
            decimals: 2,
        }
    }
}

impl TransactionPolicy {
    /// Largest balance magnitude any backend can store
    ///
    /// Relational storage keeps balances as `i64` minor units, so the limit
    /// is `i64::MAX` minor units at the configured precision.
    pub fn max_balance(&self) -> Decimal {
        Decimal::try_new(i64::MAX, self.decimals).unwrap_or(Decimal::MAX)
    }
}

impl From<&LedgerConfig> for TransactionPolicy {
    fn from(config: &LedgerConfig) -> Self {
        TransactionPolicy {
            allow_overdraft: config.economy.allow_overdraft,
            allow_self_transfer: config.economy.allow_self_transfer,
            decimals: config.currency.decimals,
        }
    }
}

/// Transaction processing engine
///
/// Shares the account store with the rest of the ledger. Safe to call from
/// many threads at once; operations on the same account are linearized by
/// the store.
pub struct TransactionEngine {
    store: Arc<AccountStore>,
    flusher: Option<Arc<WriteFlusher>>,
    subscribers: Vec<Arc<dyn TransactionSubscriber>>,
    policy: TransactionPolicy,
}

impl TransactionEngine {
    /// Create an engine without a flusher or subscribers
    ///
    /// Mutations still mark accounts dirty, so a later flush finds them.
    pub fn new(store: Arc<AccountStore>, policy: TransactionPolicy) -> Self {
        TransactionEngine {
            store,
            flusher: None,
            subscribers: Vec::new(),
            policy,
        }
    }

    /// Queue every touched account on `flusher`
    pub fn with_flusher(mut self, flusher: Arc<WriteFlusher>) -> Self {
        self.flusher = Some(flusher);
        self
    }

    /// Register a subscriber; subscribers are notified in registration order
    pub fn subscribe(&mut self, subscriber: Arc<dyn TransactionSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn policy(&self) -> TransactionPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        &self.store
    }

    /// Current balance, loading the account on first reference
    pub fn balance(&self, economable: &Economable) -> Result<Decimal, LedgerError> {
        Ok(self.store.get(economable)?.balance)
    }

    /// Whether the balance covers `amount`
    pub fn has_balance(&self, economable: &Economable, amount: Decimal) -> Result<bool, LedgerError> {
        Ok(self.balance(economable)? >= amount)
    }

    pub fn deposit(
        &self,
        economable: &Economable,
        amount: Decimal,
        reason: TransactionReason,
    ) -> Result<Transaction, LedgerError> {
        self.process(TransactionRequest::deposit(economable.clone(), amount, reason))
    }

    pub fn withdraw(
        &self,
        economable: &Economable,
        amount: Decimal,
        reason: TransactionReason,
    ) -> Result<Transaction, LedgerError> {
        self.process(TransactionRequest::withdraw(economable.clone(), amount, reason))
    }

    pub fn transfer(
        &self,
        sender: &Economable,
        receiver: &Economable,
        amount: Decimal,
        reason: TransactionReason,
    ) -> Result<Transaction, LedgerError> {
        self.process(TransactionRequest::transfer(
            sender.clone(),
            receiver.clone(),
            amount,
            reason,
        ))
    }

    /// Set a balance outright
    ///
    /// The change is emitted as a system deposit or withdrawal of the
    /// difference, so subscribers still see every movement of funds.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(Transaction))` - The emitted difference
    /// * `Ok(None)` - The balance already had that value; nothing is emitted
    pub fn set_balance(
        &self,
        economable: &Economable,
        target: Decimal,
        reason: TransactionReason,
    ) -> Result<Option<Transaction>, LedgerError> {
        if target.normalize().scale() > self.policy.decimals {
            return Err(LedgerError::invalid_amount(target, "too many decimal places"));
        }
        if target < Decimal::ZERO && !self.policy.allow_overdraft {
            return Err(LedgerError::invalid_amount(target, "balance cannot be negative"));
        }
        if target.abs() > self.policy.max_balance() {
            return Err(LedgerError::invalid_amount(target, "exceeds the largest storable balance"));
        }
        if self.balance(economable)? == target {
            return Ok(None);
        }

        let mut previous = Decimal::ZERO;
        self.store.update(economable, |balance| {
            previous = *balance;
            *balance = target;
            Ok(())
        })?;

        let request = if target > previous {
            TransactionRequest::deposit(economable.clone(), target - previous, reason)
        } else if target < previous {
            TransactionRequest::withdraw(economable.clone(), previous - target, reason)
        } else {
            // A concurrent update got there first
            return Ok(None);
        };

        Ok(Some(self.emit(request)))
    }

    /// Validate, apply and emit a single request
    ///
    /// # Returns
    ///
    /// * `Ok(Transaction)` - The emitted record
    /// * `Err(LedgerError)` - The request was rejected; no balance changed
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` for a non-positive amount or too many decimal places
    /// - `UnknownEconomable` when neither side is an economable
    /// - `SelfTransfer` when sender and receiver match and policy forbids it
    /// - `InsufficientFunds` when the debit would go below zero
    /// - `ArithmeticOverflow` when a balance would leave the storable range
    /// - `Storage` when an account could not be loaded
    pub fn process(&self, request: TransactionRequest) -> Result<Transaction, LedgerError> {
        self.validate(&request)?;

        match (request.sender.economable(), request.receiver.economable()) {
            (None, None) => return Err(LedgerError::unknown_economable(&request.sender.to_string())),
            (Some(sender), Some(receiver)) if sender == receiver => {
                // Materialize so the emitted record names a real account
                self.store.get(sender)?;
            }
            (None, Some(receiver)) => {
                self.apply(receiver, request.amount, true)?;
            }
            (Some(sender), None) => {
                self.apply(sender, -request.amount, self.policy.allow_overdraft)?;
            }
            (Some(sender), Some(receiver)) => self.apply_transfer(sender, receiver, request.amount)?,
        }

        Ok(self.emit(request))
    }

    fn validate(&self, request: &TransactionRequest) -> Result<(), LedgerError> {
        if request.amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(request.amount, "must be positive"));
        }
        if request.amount.normalize().scale() > self.policy.decimals {
            return Err(LedgerError::invalid_amount(
                request.amount,
                "too many decimal places",
            ));
        }

        if let (Party::Economable(sender), Party::Economable(receiver)) =
            (&request.sender, &request.receiver)
        {
            if sender == receiver && !self.policy.allow_self_transfer {
                return Err(LedgerError::self_transfer(sender));
            }
        }

        Ok(())
    }

    fn apply_transfer(
        &self,
        sender: &Economable,
        receiver: &Economable,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        // Load the receiver first so a storage failure rejects before any debit
        self.store.get(receiver)?;

        self.apply(sender, -amount, self.policy.allow_overdraft)?;

        if let Err(credit_error) = self.apply(receiver, amount, true) {
            if let Err(rollback_error) = self.store.apply(sender, amount, true) {
                error!(
                    %sender,
                    %amount,
                    error = %rollback_error,
                    "failed to restore sender after rejected credit"
                );
            }
            return Err(credit_error);
        }

        Ok(())
    }

    fn apply(&self, economable: &Economable, delta: Decimal, allow_overdraft: bool) -> Result<(), LedgerError> {
        self.store
            .apply_within(economable, delta, allow_overdraft, self.policy.max_balance())?;
        Ok(())
    }

    fn emit(&self, request: TransactionRequest) -> Transaction {
        let transaction = Transaction::from_request(request);

        if let Some(flusher) = &self.flusher {
            for economable in transaction.economables() {
                flusher.enqueue(economable);
            }
        }

        debug!(
            sender = %transaction.sender,
            receiver = %transaction.receiver,
            amount = %transaction.amount,
            reason = %transaction.reason,
            "transaction applied"
        );

        for subscriber in &self.subscribers {
            subscriber.on_transaction(&transaction);
        }

        transaction
    }
}
