//! Transaction-related types for the ledger
//!
//! This module defines transaction requests accepted by the engine and the
//! immutable transaction records it emits to subscribers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

use super::economable::Economable;

/// Key printed for the system side of a deposit or withdrawal
pub const SYSTEM_PARTY: &str = "system";

/// One side of a transaction
///
/// Deposits have the system as sender and withdrawals have the system as
/// receiver. The system never has a balance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum Party {
    System,
    Economable(Economable),
}

impl Party {
    /// The economable behind this party, unless it is the system
    pub fn economable(&self) -> Option<&Economable> {
        match self {
            Party::System => None,
            Party::Economable(economable) => Some(economable),
        }
    }
}

impl From<Economable> for Party {
    fn from(value: Economable) -> Self {
        Party::Economable(value)
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::System => f.write_str(SYSTEM_PARTY),
            Party::Economable(economable) => write!(f, "{}", economable),
        }
    }
}

impl From<Party> for String {
    fn from(value: Party) -> Self {
        value.to_string()
    }
}

/// Why a transaction happened
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum TransactionReason {
    /// A player paid another economable
    PlayerPay,
    /// An administrator added funds
    AdminGive,
    /// An administrator removed funds
    AdminTake,
    /// An administrator set a balance outright
    AdminSet,
    /// A third-party integration added funds
    PluginGive,
    /// A third-party integration removed funds
    PluginTake,
    /// Initial funds granted to a new economable
    StartingBalance,
    /// Anything else, tagged by the caller
    Custom(String),
}

impl fmt::Display for TransactionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionReason::PlayerPay => f.write_str("player_pay"),
            TransactionReason::AdminGive => f.write_str("admin_give"),
            TransactionReason::AdminTake => f.write_str("admin_take"),
            TransactionReason::AdminSet => f.write_str("admin_set"),
            TransactionReason::PluginGive => f.write_str("plugin_give"),
            TransactionReason::PluginTake => f.write_str("plugin_take"),
            TransactionReason::StartingBalance => f.write_str("starting_balance"),
            TransactionReason::Custom(tag) => write!(f, "custom:{}", tag),
        }
    }
}

impl From<TransactionReason> for String {
    fn from(value: TransactionReason) -> Self {
        value.to_string()
    }
}

/// A mutation requested of the transaction engine
///
/// A request is only a proposal; it goes through validation before anything
/// is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    pub sender: Party,
    pub receiver: Party,
    pub amount: Decimal,
    pub reason: TransactionReason,
}

impl TransactionRequest {
    /// Funds moving from the system to an economable
    pub fn deposit(receiver: Economable, amount: Decimal, reason: TransactionReason) -> Self {
        TransactionRequest {
            sender: Party::System,
            receiver: Party::Economable(receiver),
            amount,
            reason,
        }
    }

    /// Funds moving from an economable back to the system
    pub fn withdraw(sender: Economable, amount: Decimal, reason: TransactionReason) -> Self {
        TransactionRequest {
            sender: Party::Economable(sender),
            receiver: Party::System,
            amount,
            reason,
        }
    }

    /// Funds moving between two economables
    pub fn transfer(
        sender: Economable,
        receiver: Economable,
        amount: Decimal,
        reason: TransactionReason,
    ) -> Self {
        TransactionRequest {
            sender: Party::Economable(sender),
            receiver: Party::Economable(receiver),
            amount,
            reason,
        }
    }
}

/// Immutable record of a successful mutation
///
/// Emitted by the engine to every subscriber after both legs were applied.
/// The ledger itself never stores these; persistence of the transaction
/// history belongs to the logger subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub sender: Party,
    pub receiver: Party,
    pub amount: Decimal,
    pub reason: TransactionReason,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// Stamp an accepted request with the current time
    pub fn from_request(request: TransactionRequest) -> Self {
        Transaction {
            sender: request.sender,
            receiver: request.receiver,
            amount: request.amount,
            reason: request.reason,
            timestamp: Utc::now(),
        }
    }

    /// Economables touched by this transaction, sender first
    pub fn economables(&self) -> impl Iterator<Item = &Economable> {
        self.sender
            .economable()
            .into_iter()
            .chain(self.receiver.economable())
    }
}
