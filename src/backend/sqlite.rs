//! Relational durable backend on SQLite
//!
//! Balances live in the `saneeconomy_balances` table as integer minor units
//! at the configured currency precision, which keeps ordering for the top
//! balance query exact. The backend owns a small fixed pool of connections;
//! callers never see them.
//!
//! Batched writes are applied as upserts inside one SQL transaction, so a
//! flush batch is either entirely durable or not at all.

use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;
use tracing::{debug, info};

use crate::core::DurableBackend;
use crate::types::{Account, Economable, StorageError};

/// Upper bound on pooled connections
pub const MAX_POOL_SIZE: usize = 8;

/// Most decimal places an `i64` minor-unit column can carry
pub const MAX_SCALE: u32 = 18;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS saneeconomy_balances (
    unique_identifier TEXT PRIMARY KEY NOT NULL,
    balance INTEGER NOT NULL
)";

const UPSERT: &str = "INSERT INTO saneeconomy_balances (unique_identifier, balance)
    VALUES (?1, ?2)
    ON CONFLICT(unique_identifier) DO UPDATE SET balance = excluded.balance";

/// Pooled SQLite backend
#[derive(Debug)]
pub struct SqliteBackend {
    path: PathBuf,
    /// `None` once the backend is closed
    pool: Vec<Mutex<Option<Connection>>>,
    next: AtomicUsize,
    /// Number of decimal places stored in the integer column
    scale: u32,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Database file
    /// * `pool_size` - Connections to keep open, clamped to `1..=MAX_POOL_SIZE`
    /// * `scale` - Currency precision; balances are stored as `balance * 10^scale`,
    ///   at most [`MAX_SCALE`]
    pub fn open(path: impl AsRef<Path>, pool_size: usize, scale: u32) -> Result<Self, StorageError> {
        if scale > MAX_SCALE {
            return Err(StorageError::Unsupported {
                reason: format!("scale {} exceeds the maximum of {}", scale, MAX_SCALE),
            });
        }
        let path = path.as_ref().to_path_buf();
        let pool_size = pool_size.clamp(1, MAX_POOL_SIZE);

        let mut pool = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            if index == 0 {
                conn.execute_batch(SCHEMA)?;
            }
            pool.push(Mutex::new(Some(conn)));
        }

        info!(path = %path.display(), pool_size, scale, "opened sqlite backend");

        Ok(SqliteBackend {
            path,
            pool,
            next: AtomicUsize::new(0),
            scale,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Run `f` on a pooled connection
    ///
    /// Prefers an idle connection; if all are busy, waits on the next one in
    /// round-robin order.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self.acquire();
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StorageError::Closed),
        }
    }

    fn acquire(&self) -> MutexGuard<'_, Option<Connection>> {
        for slot in &self.pool {
            match slot.try_lock() {
                Ok(guard) => return guard,
                Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => continue,
            }
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn to_minor(&self, economable: &Economable, balance: Decimal) -> Result<i64, StorageError> {
        let factor = Decimal::from(10_i64.pow(self.scale));
        let scaled = balance
            .checked_mul(factor)
            .ok_or_else(|| StorageError::corrupt(economable.key(), "balance out of range"))?;

        if !scaled.fract().is_zero() {
            return Err(StorageError::corrupt(
                economable.key(),
                format!("balance {} has more than {} decimal places", balance, self.scale),
            ));
        }

        scaled
            .to_i64()
            .ok_or_else(|| StorageError::corrupt(economable.key(), "balance out of range"))
    }

    fn from_minor(&self, minor: i64) -> Decimal {
        Decimal::new(minor, self.scale)
    }

    fn parse_row(&self, key: String, minor: i64) -> Result<(Economable, Decimal), StorageError> {
        let economable =
            Economable::parse(&key).map_err(|e| StorageError::corrupt(&key, e.to_string()))?;
        Ok((economable, self.from_minor(minor)))
    }
}

impl DurableBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn load_all(&self) -> Result<Vec<Account>, StorageError> {
        let rows = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT unique_identifier, balance FROM saneeconomy_balances")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(key, minor)| {
                let (economable, balance) = self.parse_row(key, minor)?;
                Ok(Account::with_balance(economable, balance))
            })
            .collect()
    }

    fn load_one(&self, economable: &Economable) -> Result<Option<Account>, StorageError> {
        let minor = self.with_conn(|conn| {
            let minor = conn
                .prepare_cached(
                    "SELECT balance FROM saneeconomy_balances WHERE unique_identifier = ?1",
                )?
                .query_row(params![economable.key()], |row| row.get::<_, i64>(0))
                .optional()?;
            Ok(minor)
        })?;

        Ok(minor.map(|minor| Account::with_balance(economable.clone(), self.from_minor(minor))))
    }

    fn persist(&self, economable: &Economable, balance: Decimal) -> Result<(), StorageError> {
        self.persist_batch(&[(economable.clone(), balance)])
    }

    fn persist_batch(&self, batch: &[(Economable, Decimal)]) -> Result<(), StorageError> {
        // Convert up front so a bad value fails before anything is written
        let rows = batch
            .iter()
            .map(|(economable, balance)| Ok((economable.key(), self.to_minor(economable, *balance)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(UPSERT)?;
                for (key, minor) in &rows {
                    stmt.execute(params![key, minor])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;

        debug!(written = rows.len(), "sqlite batch committed");
        Ok(())
    }

    fn top_n(&self, n: usize) -> Result<Vec<(Economable, Decimal)>, StorageError> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT unique_identifier, balance FROM saneeconomy_balances
                 ORDER BY balance DESC, unique_identifier ASC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(key, minor)| self.parse_row(key, minor))
            .collect()
    }

    fn flush_and_wait(&self) -> Result<(), StorageError> {
        // Commits are already durable; fold the WAL back into the main file
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
            Ok(())
        })
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut closed = 0;
        for slot in &self.pool {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| StorageError::from(e))?;
                closed += 1;
            }
        }

        info!(path = %self.path.display(), closed, "sqlite backend closed");
        Ok(())
    }
}
