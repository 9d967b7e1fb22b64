//! Flat-file durable backend
//!
//! Stores every balance in a single CSV file with columns
//! `economable,balance`. The whole file is read at open and rewritten on
//! every persisted batch, so it suits small economies only.
//!
//! Writes go to a sibling temporary file which then replaces the original,
//! so a crash mid-write leaves the previous file intact.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::core::DurableBackend;
use crate::types::{Account, Economable, StorageError};

/// One line of the balance file, as read before validation
#[derive(Debug, Deserialize)]
struct BalanceRow {
    economable: String,
    balance: String,
}

impl BalanceRow {
    fn parse(self) -> Result<(Economable, Decimal), StorageError> {
        let economable = Economable::parse(self.economable.trim())
            .map_err(|e| StorageError::corrupt(&self.economable, e.to_string()))?;
        let balance = Decimal::from_str(self.balance.trim()).map_err(|_| {
            StorageError::corrupt(&self.economable, format!("invalid balance '{}'", self.balance))
        })?;
        Ok((economable, balance))
    }
}

#[derive(Debug)]
struct FlatFileState {
    balances: BTreeMap<Economable, Decimal>,
    closed: bool,
}

/// CSV file backend
#[derive(Debug)]
pub struct FlatFileBackend {
    path: PathBuf,
    state: Mutex<FlatFileState>,
}

impl FlatFileBackend {
    /// Open the balance file at `path`, creating nothing until the first write
    ///
    /// # Returns
    ///
    /// * `Ok(FlatFileBackend)` - With every stored balance loaded
    /// * `Err(StorageError)` - If the file exists but cannot be read or parsed
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let balances = if path.exists() {
            read_balances(&path)?
        } else {
            BTreeMap::new()
        };

        info!(path = %path.display(), accounts = balances.len(), "opened flat-file backend");

        Ok(FlatFileBackend {
            path,
            state: Mutex::new(FlatFileState {
                balances,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> Result<MutexGuard<'_, FlatFileState>, StorageError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(StorageError::Closed);
        }
        Ok(state)
    }
}

impl DurableBackend for FlatFileBackend {
    fn name(&self) -> &'static str {
        "flatfile"
    }

    fn load_all(&self) -> Result<Vec<Account>, StorageError> {
        let state = self.state()?;
        Ok(state
            .balances
            .iter()
            .map(|(economable, balance)| Account::with_balance(economable.clone(), *balance))
            .collect())
    }

    fn load_one(&self, economable: &Economable) -> Result<Option<Account>, StorageError> {
        let state = self.state()?;
        Ok(state
            .balances
            .get(economable)
            .map(|balance| Account::with_balance(economable.clone(), *balance)))
    }

    fn persist(&self, economable: &Economable, balance: Decimal) -> Result<(), StorageError> {
        self.persist_batch(&[(economable.clone(), balance)])
    }

    fn persist_batch(&self, batch: &[(Economable, Decimal)]) -> Result<(), StorageError> {
        let mut state = self.state()?;

        // Only publish the new balances once they are on disk
        let mut next = state.balances.clone();
        for (economable, balance) in batch {
            next.insert(economable.clone(), *balance);
        }
        write_balances(&self.path, &next)?;
        state.balances = next;

        debug!(path = %self.path.display(), written = batch.len(), "balance file rewritten");
        Ok(())
    }

    fn top_n(&self, n: usize) -> Result<Vec<(Economable, Decimal)>, StorageError> {
        let state = self.state()?;

        let mut entries: Vec<(Economable, Decimal)> = state
            .balances
            .iter()
            .map(|(economable, balance)| (economable.clone(), *balance))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        Ok(entries)
    }

    fn flush_and_wait(&self) -> Result<(), StorageError> {
        // Writes are synchronous; holding the lock waits out any in progress
        self.state().map(|_| ())
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        Ok(())
    }
}

fn read_balances(path: &Path) -> Result<BTreeMap<Economable, Decimal>, StorageError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut balances = BTreeMap::new();

    for row in reader.deserialize::<BalanceRow>() {
        let (economable, balance) = row?.parse()?;
        balances.insert(economable, balance);
    }

    Ok(balances)
}

fn write_balances(path: &Path, balances: &BTreeMap<Economable, Decimal>) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)?;
        let mut writer = csv::Writer::from_writer(file);

        // Header is written even for an empty file so it can be read back
        writer.write_record(["economable", "balance"])?;
        for (economable, balance) in balances {
            writer.write_record([economable.key(), balance.to_string().as_str()])?;
        }

        let mut file = writer
            .into_inner()
            .map_err(|e| StorageError::from(e.into_error()))?;
        file.flush()?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn faction(name: &str) -> Economable {
        Economable::faction(name).unwrap()
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let backend = FlatFileBackend::open(dir.path().join("balances.csv")).unwrap();

        assert!(backend.load_all().unwrap().is_empty());
        assert_eq!(backend.load_one(&faction("red")).unwrap(), None);
    }

    #[test]
    fn test_persisted_balances_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("balances.csv");

        let backend = FlatFileBackend::open(&path).unwrap();
        backend
            .persist_batch(&[
                (faction("red"), Decimal::new(1050, 2)),
                (faction("blue"), Decimal::new(3, 0)),
            ])
            .unwrap();
        backend.persist(&faction("red"), Decimal::new(1100, 2)).unwrap();
        backend.close().unwrap();

        let reopened = FlatFileBackend::open(&path).unwrap();
        let red = reopened.load_one(&faction("red")).unwrap().unwrap();
        assert_eq!(red.balance, Decimal::new(1100, 2));
        assert_eq!(reopened.load_all().unwrap().len(), 2);
    }

    #[test]
    fn test_top_n_is_sorted_descending() {
        let dir = TempDir::new().unwrap();
        let backend = FlatFileBackend::open(dir.path().join("balances.csv")).unwrap();
        backend
            .persist_batch(&[
                (faction("a"), Decimal::new(1, 0)),
                (faction("b"), Decimal::new(3, 0)),
                (faction("c"), Decimal::new(2, 0)),
            ])
            .unwrap();

        let top: Vec<String> = backend
            .top_n(2)
            .unwrap()
            .into_iter()
            .map(|(e, _)| e.to_string())
            .collect();

        assert_eq!(top, vec!["faction:b", "faction:c"]);
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("balances.csv");
        fs::write(&path, "economable,balance\nnpc:bob,10\n").unwrap();

        let error = FlatFileBackend::open(&path).unwrap_err();

        assert!(matches!(error, StorageError::Corrupt { .. }));
        assert!(!error.is_transient());
    }

    #[test]
    fn test_closed_backend_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let backend = FlatFileBackend::open(dir.path().join("balances.csv")).unwrap();
        backend.close().unwrap();

        assert_eq!(
            backend.persist(&faction("red"), Decimal::ONE).unwrap_err(),
            StorageError::Closed
        );
    }
}
