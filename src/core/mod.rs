//! Core ledger components
//!
//! This module contains the storage, cache and transaction components:
//! - `traits` - Seams to storage, subscribers, presence and the relay
//! - `account_store` - Cache-first account state with per-key exclusion
//! - `flusher` - Background writer from the store to the backend
//! - `top_balances` - Periodically refreshed leaderboard
//! - `engine` - Validation, application and emission of transactions

pub mod account_store;
pub mod engine;
pub mod flusher;
pub mod top_balances;
pub mod traits;

pub use account_store::{AccountStore, WriteOutcome};
pub use engine::{TransactionEngine, TransactionPolicy};
pub use flusher::{FlushReport, WriteFlusher};
pub use top_balances::{RankedBalance, TopBalanceCache, TopBalances};
pub use traits::{
    DurableBackend, NobodyPresent, PersistListener, PresenceOracle, RelayTransport,
    TransactionSubscriber,
};
