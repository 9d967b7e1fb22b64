//! Types module
//!
//! Contains core data structures used throughout the ledger.
//! This module organizes types into logical submodules:
//! - `economable`: Namespaced identities of balance holders
//! - `account`: Cached account state
//! - `transaction`: Transaction requests and emitted records
//! - `error`: Error types for the ledger

pub mod account;
pub mod economable;
pub mod error;
pub mod transaction;

pub use account::{Account, Sequence};
pub use economable::{Economable, EconomableKind};
pub use error::{FlushFailure, LedgerError, RelayError, StorageError};
pub use transaction::{Party, Transaction, TransactionReason, TransactionRequest};
