//! SaneLedger Library
//! # Overview
//!
//! A durable, cache-accelerated account ledger. Balances are served from an
//! in-memory cache, written back to a pluggable durable store in the
//! background, and kept convergent across several servers sharing one store
//! through invalidation messages on an external relay.
//!
//! # Architecture
//!
//! - [`types`] - Core data types (Economable, Account, Transaction, errors)
//! - [`core`] - The ledger itself:
//!   - [`core::account_store`] - Cache-first account state, per-key exclusion
//!   - [`core::flusher`] - Coalescing background writer with a drain barrier
//!   - [`core::top_balances`] - Periodically refreshed leaderboard
//!   - [`core::engine`] - Validate, apply and emit transactions
//! - [`backend`] - Flat-file, SQLite and in-memory durable backends
//! - [`sync`] - Cross-server invalidation protocol and relay adapter
//! - [`logger`] - Transaction log subscribers
//! - [`ledger`] - Component wiring and lifecycle
//! - [`config`], [`logging`], [`cli`] - Host shim
//!
//! # Example
//!
//! ```no_run
//! use rust_decimal::Decimal;
//! use saneledger::{Collaborators, Economable, Ledger, LedgerConfig, TransactionReason};
//!
//! # async fn demo() -> Result<(), saneledger::LedgerError> {
//! let ledger = Ledger::start(LedgerConfig::default(), Collaborators::default()).await?;
//! let red = Economable::faction("red")?;
//! let blue = Economable::faction("blue")?;
//!
//! ledger.engine().deposit(&red, Decimal::new(100, 0), TransactionReason::StartingBalance)?;
//! ledger.engine().transfer(&red, &blue, Decimal::new(30, 0), TransactionReason::PlayerPay)?;
//!
//! let report = ledger.shutdown().await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod backend;
pub mod cli;
pub mod config;
pub mod core;
pub mod ledger;
pub mod logger;
pub mod logging;
pub mod sync;
pub mod types;

pub use crate::config::LedgerConfig;
pub use crate::core::{AccountStore, FlushReport, TopBalanceCache, TransactionEngine, WriteFlusher};
pub use crate::ledger::{Collaborators, Ledger};
pub use types::{
    Account, Economable, FlushFailure, LedgerError, Party, RelayError, StorageError, Transaction,
    TransactionReason, TransactionRequest,
};
