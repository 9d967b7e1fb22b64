//! Error types for the ledger
//!
//! This module defines every error the ledger can report.
//!
//! # Error Categories
//!
//! - **Validation errors** (`LedgerError`): bad amount, unknown economable,
//!   self transfer, insufficient funds. Rejected synchronously, nothing applied.
//! - **Storage errors** (`StorageError`): raised by durable backends. Transient
//!   ones are retried by the write flusher; permanent ones are reported through
//!   a [`FlushReport`](crate::core::FlushReport) and never roll back balances.
//! - **Relay errors** (`RelayError`): malformed or oversized sync messages.
//!   Logged and dropped, never applied to local state.

use rust_decimal::Decimal;
use thiserror::Error;

use super::economable::Economable;

/// Caller-facing error type for ledger operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// Amount is zero, negative, or finer than the currency precision
    #[error("Invalid amount {amount}: {reason}")]
    InvalidAmount {
        /// The rejected amount
        amount: Decimal,
        /// Why it was rejected
        reason: String,
    },

    /// Key is not a well-formed economable in a known namespace
    #[error("Unknown economable '{key}'")]
    UnknownEconomable {
        /// The rejected key
        key: String,
    },

    /// Sender and receiver are the same and policy forbids it
    #[error("Cannot transfer from {economable} to itself")]
    SelfTransfer { economable: String },

    /// The debit would drive a balance below zero
    #[error("Insufficient funds for {economable}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        economable: String,
        balance: Decimal,
        requested: Decimal,
    },

    /// Balance arithmetic would overflow the decimal range
    #[error("Arithmetic overflow in {operation} for {economable}")]
    ArithmeticOverflow {
        operation: String,
        economable: String,
    },

    /// Durable backend could not serve a lazy load
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl LedgerError {
    pub fn invalid_amount(amount: Decimal, reason: &str) -> Self {
        LedgerError::InvalidAmount {
            amount,
            reason: reason.to_string(),
        }
    }

    pub fn unknown_economable(key: &str) -> Self {
        LedgerError::UnknownEconomable {
            key: key.to_string(),
        }
    }

    pub fn self_transfer(economable: &Economable) -> Self {
        LedgerError::SelfTransfer {
            economable: economable.to_string(),
        }
    }

    pub fn insufficient_funds(economable: &Economable, balance: Decimal, requested: Decimal) -> Self {
        LedgerError::InsufficientFunds {
            economable: economable.to_string(),
            balance,
            requested,
        }
    }

    pub fn arithmetic_overflow(operation: &str, economable: &Economable) -> Self {
        LedgerError::ArithmeticOverflow {
            operation: operation.to_string(),
            economable: economable.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        LedgerError::Config {
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(error: config::ConfigError) -> Self {
        LedgerError::config(error.to_string())
    }
}

/// Errors raised by durable backends
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    /// I/O failure talking to the store
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Flat-file contents could not be read or written as CSV
    #[error("CSV error{}: {message}", line.map(|l| format!(" at line {}", l)).unwrap_or_default())]
    Csv { line: Option<u64>, message: String },

    /// Relational store failure
    #[error("SQLite error: {message}")]
    Sqlite {
        message: String,
        /// The database was busy or locked; the statement may succeed later
        busy: bool,
    },

    /// Stored data cannot be interpreted
    #[error("Corrupt record for '{key}': {detail}")]
    Corrupt { key: String, detail: String },

    /// The store is temporarily unreachable
    #[error("Backend unavailable: {reason}")]
    Unavailable { reason: String },

    /// The backend cannot be used with the requested settings
    #[error("Unsupported backend setting: {reason}")]
    Unsupported { reason: String },

    /// The backend was closed and accepts no further operations
    #[error("Backend is closed")]
    Closed,
}

impl StorageError {
    pub fn corrupt(key: &str, detail: impl Into<String>) -> Self {
        StorageError::Corrupt {
            key: key.to_string(),
            detail: detail.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        StorageError::Unavailable {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io { .. } | StorageError::Unavailable { .. } => true,
            StorageError::Sqlite { busy, .. } => *busy,
            StorageError::Csv { .. }
            | StorageError::Corrupt { .. }
            | StorageError::Unsupported { .. }
            | StorageError::Closed => false,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        StorageError::Io {
            message: error.to_string(),
        }
    }
}

impl From<csv::Error> for StorageError {
    fn from(error: csv::Error) -> Self {
        let line = error.position().map(|pos| pos.line());

        StorageError::Csv {
            line,
            message: error.to_string(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(error: rusqlite::Error) -> Self {
        let busy = matches!(
            error.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
        );

        StorageError::Sqlite {
            message: error.to_string(),
            busy,
        }
    }
}

/// A write that could not be made durable after every retry
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Failed to persist {economable} after {attempts} attempt(s): {error}")]
pub struct FlushFailure {
    pub economable: Economable,
    pub attempts: u32,
    pub error: StorageError,
}

/// Errors raised while encoding, decoding or sending relay messages
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayError {
    /// Frame is truncated or not valid UTF-8
    #[error("Malformed relay message: {reason}")]
    Malformed { reason: String },

    /// Namespace matched but the opcode is not one this version knows
    #[error("Unknown relay opcode '{opcode}'")]
    UnknownOpcode { opcode: String },

    /// A string field does not fit the 16-bit length prefix
    #[error("Relay string field of {len} bytes exceeds the 65535 byte limit")]
    StringTooLong { len: usize },

    /// The external relay rejected or dropped the frame
    #[error("Relay transport error: {message}")]
    Transport { message: String },
}

impl RelayError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        RelayError::Malformed {
            reason: reason.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        RelayError::Transport {
            message: message.into(),
        }
    }
}
