//! Transaction loggers
//!
//! Subscribers that record every emitted transaction: one as structured
//! `tracing` events, one as an append-only CSV audit file.

use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::core::TransactionSubscriber;
use crate::types::{StorageError, Transaction};

/// Logs each transaction at `info` under the `saneledger::transactions` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTransactionLogger;

impl TransactionSubscriber for TracingTransactionLogger {
    fn on_transaction(&self, transaction: &Transaction) {
        info!(
            target: "saneledger::transactions",
            sender = %transaction.sender,
            receiver = %transaction.receiver,
            amount = %transaction.amount,
            reason = %transaction.reason,
            timestamp = %transaction.timestamp.to_rfc3339(),
            "transaction"
        );
    }
}

/// Appends each transaction to a CSV file
///
/// Columns: `sender,receiver,amount,reason,timestamp`. The header is written
/// only when the file starts out empty.
#[derive(Debug)]
pub struct CsvTransactionLogger {
    path: PathBuf,
    writer: Mutex<csv::Writer<std::fs::File>>,
}

impl CsvTransactionLogger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let empty = file.metadata()?.len() == 0;

        let writer = WriterBuilder::new().has_headers(empty).from_writer(file);

        Ok(CsvTransactionLogger {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, transaction: &Transaction) -> Result<(), StorageError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.serialize(transaction)?;
        writer.flush()?;
        Ok(())
    }
}

impl TransactionSubscriber for CsvTransactionLogger {
    fn on_transaction(&self, transaction: &Transaction) {
        if let Err(error) = self.append(transaction) {
            warn!(path = %self.path.display(), %error, "failed to append transaction log");
        }
    }
}
