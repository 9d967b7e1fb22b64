//! Ledger assembly and lifecycle
//!
//! `Ledger` builds every component from configuration and hands each one its
//! dependencies explicitly:
//!
//! ```text
//! Ledger
//!     ├── Arc<dyn DurableBackend>   (opened from config)
//!     ├── Arc<AccountStore>         (preloaded from the backend)
//!     ├── Arc<WriteFlusher>         (worker task)
//!     ├── TransactionEngine         (subscribers: loggers, then relay)
//!     ├── Arc<TopBalanceCache>      (timer task)
//!     └── Option<Arc<SyncRelayAdapter>>
//! ```
//!
//! Must be started inside a tokio runtime.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use crate::backend::open_backend;
use crate::config::LedgerConfig;
use crate::core::{
    AccountStore, DurableBackend, FlushReport, NobodyPresent, PresenceOracle, RelayTransport,
    TopBalanceCache, TransactionEngine, TransactionPolicy, TransactionSubscriber, WriteFlusher,
};
use crate::logger::{CsvTransactionLogger, TracingTransactionLogger};
use crate::sync::SyncRelayAdapter;
use crate::types::{Account, Economable, LedgerError, StorageError};

/// Host-provided parts the ledger does not build itself
#[derive(Clone)]
pub struct Collaborators {
    /// Which economables have a session on this server
    pub presence: Arc<dyn PresenceOracle>,

    /// Outbound relay; required for multi-server sync
    pub transport: Option<Arc<dyn RelayTransport>>,

    /// Extra subscribers, notified after the built-in loggers and before
    /// the relay
    pub subscribers: Vec<Arc<dyn TransactionSubscriber>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            presence: Arc::new(NobodyPresent),
            transport: None,
            subscribers: Vec::new(),
        }
    }
}

struct Components {
    backend: Arc<dyn DurableBackend>,
    store: Arc<AccountStore>,
    flusher: Arc<WriteFlusher>,
    engine: TransactionEngine,
    top_balances: Arc<TopBalanceCache>,
    relay: Option<Arc<SyncRelayAdapter>>,
    baltop_timer: JoinHandle<()>,
}

/// A running ledger
pub struct Ledger {
    config: LedgerConfig,
    collaborators: Collaborators,
    components: Components,
    relay_listener: Option<JoinHandle<()>>,
}

impl Ledger {
    /// Open the configured backend, load it and start the background tasks
    pub async fn start(config: LedgerConfig, collaborators: Collaborators) -> Result<Self, LedgerError> {
        config.validate()?;
        let components = open_and_build(&config, &collaborators).await?;

        Ok(Ledger {
            config,
            collaborators,
            components,
            relay_listener: None,
        })
    }

    /// Start on an already opened backend
    ///
    /// The `backend` section of `config` is ignored until the next
    /// [`reload`](Self::reload).
    pub async fn start_with_backend(
        config: LedgerConfig,
        backend: Arc<dyn DurableBackend>,
        collaborators: Collaborators,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        let components = build(&config, backend, &collaborators).await?;

        Ok(Ledger {
            config,
            collaborators,
            components,
            relay_listener: None,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn engine(&self) -> &TransactionEngine {
        &self.components.engine
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        &self.components.store
    }

    pub fn backend(&self) -> &Arc<dyn DurableBackend> {
        &self.components.backend
    }

    pub fn top_balances(&self) -> &Arc<TopBalanceCache> {
        &self.components.top_balances
    }

    pub fn flusher(&self) -> &Arc<WriteFlusher> {
        &self.components.flusher
    }

    /// The sync adapter, when multi-server sync is active
    pub fn relay(&self) -> Option<&Arc<SyncRelayAdapter>> {
        self.components.relay.as_ref()
    }

    /// Apply an inbound relay frame; a no-op when sync is off
    ///
    /// Reads the backend on the caller's thread.
    pub fn handle_relay_frame(&self, frame: &[u8]) -> Option<Account> {
        self.components.relay.as_ref()?.handle_frame(frame)
    }

    /// Apply every frame received on `inbound` in the background
    ///
    /// Returns `false` when sync is off. The listener is stopped by
    /// [`reload`](Self::reload) and [`shutdown`](Self::shutdown).
    pub fn spawn_relay_listener(&mut self, inbound: mpsc::UnboundedReceiver<Bytes>) -> bool {
        let Some(relay) = &self.components.relay else {
            warn!("relay listener requested but multi-server sync is off");
            return false;
        };

        if let Some(previous) = self.relay_listener.replace(relay.spawn_listener(inbound)) {
            previous.abort();
        }
        true
    }

    /// Drain all pending writes
    pub async fn flush(&self) -> FlushReport {
        self.components.flusher.flush_and_wait().await
    }

    /// Refresh the leaderboard now instead of waiting for the timer
    pub async fn refresh_top_balances(&self) -> Result<usize, StorageError> {
        self.components.top_balances.refresh().await
    }

    /// Re-read one account from the backend, discarding the cached balance
    pub async fn force_reload(&self, economable: &Economable) -> Result<Option<Account>, StorageError> {
        let store = Arc::clone(&self.components.store);
        let economable = economable.clone();
        tokio::task::spawn_blocking(move || store.force_reload(&economable))
            .await
            .map_err(blocking_failed)?
    }

    /// Switch to a new configuration
    ///
    /// Pending writes are drained before the new backend is opened and
    /// loaded. Only once that succeeds are the old components stopped and
    /// the old backend closed; if it fails, the ledger keeps running on its
    /// current configuration. The relay listener is stopped on success; spawn
    /// a new one if sync stays on.
    ///
    /// # Returns
    ///
    /// The combined report of the drain and the old components' final flush
    pub async fn reload(&mut self, config: LedgerConfig) -> Result<FlushReport, LedgerError> {
        config.validate()?;
        info!("reloading ledger configuration");

        // The new backend may share storage with the old one
        let drained = self.components.flusher.flush_and_wait().await;

        let components = match open_and_build(&config, &self.collaborators).await {
            Ok(components) => components,
            Err(error) => {
                warn!(%error, "reload failed, keeping the running configuration");
                return Err(error);
            }
        };

        if let Some(listener) = self.relay_listener.take() {
            listener.abort();
        }
        let previous = std::mem::replace(&mut self.components, components);
        let mut report = previous.stop().await;
        // Failures of the drain were retried by the final flush
        report.persisted += drained.persisted;

        self.config = config;
        Ok(report)
    }

    /// Flush, stop background tasks and close the backend
    pub async fn shutdown(mut self) -> FlushReport {
        if let Some(listener) = self.relay_listener.take() {
            listener.abort();
        }
        let report = self.components.stop().await;
        info!(
            persisted = report.persisted,
            failed = report.failures.len(),
            "ledger shut down"
        );
        report
    }
}

impl Components {
    async fn stop(self) -> FlushReport {
        let mut report = self.flusher.shutdown().await;
        self.baltop_timer.abort();

        if let Err(error) = close_backend(self.backend).await {
            warn!(%error, "failed to close backend");
            report.backend_error.get_or_insert(error);
        }

        report
    }
}

async fn open_and_build(
    config: &LedgerConfig,
    collaborators: &Collaborators,
) -> Result<Components, LedgerError> {
    let backend_config = config.backend.clone();
    let decimals = config.currency.decimals;
    let backend = tokio::task::spawn_blocking(move || open_backend(&backend_config, decimals))
        .await
        .map_err(blocking_failed)??;

    match build(config, Arc::clone(&backend), collaborators).await {
        Ok(components) => Ok(components),
        Err(error) => {
            if let Err(close_error) = close_backend(backend).await {
                warn!(error = %close_error, "failed to close backend after a failed start");
            }
            Err(error)
        }
    }
}

async fn close_backend(backend: Arc<dyn DurableBackend>) -> Result<(), StorageError> {
    tokio::task::spawn_blocking(move || backend.close())
        .await
        .map_err(blocking_failed)?
}

async fn build(
    config: &LedgerConfig,
    backend: Arc<dyn DurableBackend>,
    collaborators: &Collaborators,
) -> Result<Components, LedgerError> {
    let loader = Arc::clone(&backend);
    let accounts = tokio::task::spawn_blocking(move || loader.load_all())
        .await
        .map_err(blocking_failed)??;

    // Everything fallible happens before any task is spawned
    let csv_logger = match &config.log.transactions {
        Some(path) => Some(CsvTransactionLogger::open(path)?),
        None => None,
    };

    let store = Arc::new(AccountStore::new(Arc::clone(&backend)));
    let loaded = accounts.len();
    store.preload(accounts);

    let flusher = Arc::new(WriteFlusher::start(
        Arc::clone(&store),
        Arc::clone(&backend),
        config.flush.clone(),
    ));

    let mut engine = TransactionEngine::new(Arc::clone(&store), TransactionPolicy::from(config))
        .with_flusher(Arc::clone(&flusher));

    engine.subscribe(Arc::new(TracingTransactionLogger));
    if let Some(logger) = csv_logger {
        engine.subscribe(Arc::new(logger));
    }
    for subscriber in &collaborators.subscribers {
        engine.subscribe(Arc::clone(subscriber));
    }

    let relay = match (config.multi_server_sync, &collaborators.transport) {
        (true, Some(transport)) => {
            let adapter = Arc::new(SyncRelayAdapter::new(
                Arc::clone(&store),
                Arc::clone(&collaborators.presence),
                Arc::clone(transport),
            ));
            engine.subscribe(adapter.clone());
            flusher.subscribe(adapter.clone());
            Some(adapter)
        }
        (true, None) => {
            warn!("multi_server_sync is on but no relay transport was provided, sync disabled");
            None
        }
        (false, _) => None,
    };

    let top_balances = Arc::new(TopBalanceCache::new(Arc::clone(&backend), config.baltop.size));
    let baltop_timer = top_balances.spawn_timer(config.baltop.update_interval());

    info!(
        backend = backend.name(),
        accounts = loaded,
        sync = relay.is_some(),
        "ledger started"
    );

    Ok(Components {
        backend,
        store,
        flusher,
        engine,
        top_balances,
        relay,
        baltop_timer,
    })
}

fn blocking_failed(error: JoinError) -> StorageError {
    StorageError::unavailable(format!("blocking task failed: {}", error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::BackendConfig;
    use crate::sync::ChannelRelay;
    use crate::types::TransactionReason;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn red() -> Economable {
        Economable::faction("red").unwrap()
    }

    #[tokio::test]
    async fn test_start_preloads_backend() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(&red(), Decimal::new(12, 0));

        let ledger = Ledger::start_with_backend(
            LedgerConfig::default(),
            backend.clone(),
            Collaborators::default(),
        )
        .await
        .unwrap();

        assert!(ledger.store().contains(&red()));
        assert_eq!(ledger.engine().balance(&red()).unwrap(), Decimal::new(12, 0));
        assert_eq!(backend.load_count(), 0);
        ledger.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let backend = Arc::new(MemoryBackend::new());
        let ledger = Ledger::start_with_backend(
            LedgerConfig::default(),
            backend.clone(),
            Collaborators::default(),
        )
        .await
        .unwrap();
        ledger
            .engine()
            .deposit(&red(), Decimal::new(5, 0), TransactionReason::AdminGive)
            .unwrap();

        let report = ledger.shutdown().await;

        assert!(report.is_clean());
        assert_eq!(backend.stored_balance(&red()), Some(Decimal::new(5, 0)));
        assert_eq!(backend.load_all().unwrap_err(), StorageError::Closed);
    }

    #[tokio::test]
    async fn test_sync_needs_a_transport() {
        let config = LedgerConfig {
            multi_server_sync: true,
            ..LedgerConfig::default()
        };

        let without = Ledger::start_with_backend(
            config.clone(),
            Arc::new(MemoryBackend::new()),
            Collaborators::default(),
        )
        .await
        .unwrap();
        assert!(without.relay().is_none());
        assert_eq!(without.handle_relay_frame(b"anything"), None);

        let (relay, _inbound) = ChannelRelay::new();
        let with = Ledger::start_with_backend(
            config,
            Arc::new(MemoryBackend::new()),
            Collaborators {
                transport: Some(Arc::new(relay)),
                ..Collaborators::default()
            },
        )
        .await
        .unwrap();
        assert!(with.relay().is_some());

        without.shutdown().await;
        with.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_switches_backend_after_flush() {
        let dir = TempDir::new().unwrap();
        let first = LedgerConfig {
            backend: BackendConfig::Flatfile {
                path: dir.path().join("economy.csv"),
            },
            ..LedgerConfig::default()
        };
        let mut ledger = Ledger::start(first, Collaborators::default()).await.unwrap();
        ledger
            .engine()
            .deposit(&red(), Decimal::new(8, 0), TransactionReason::AdminGive)
            .unwrap();

        let second = LedgerConfig {
            backend: BackendConfig::Sqlite {
                path: dir.path().join("economy.db"),
                pool_size: Some(1),
            },
            ..LedgerConfig::default()
        };
        let report = ledger.reload(second).await.unwrap();

        assert_eq!(report.persisted, 1);
        assert_eq!(ledger.backend().name(), "sqlite");
        // The new backend starts empty; the flat file kept the old balance
        assert_eq!(ledger.engine().balance(&red()).unwrap(), Decimal::ZERO);
        let old = crate::backend::FlatFileBackend::open(dir.path().join("economy.csv")).unwrap();
        assert_eq!(old.load_one(&red()).unwrap().unwrap().balance, Decimal::new(8, 0));
        ledger.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_running_ledger() {
        let mut ledger = Ledger::start_with_backend(
            LedgerConfig::default(),
            Arc::new(MemoryBackend::new()),
            Collaborators::default(),
        )
        .await
        .unwrap();
        let mut bad = LedgerConfig::default();
        bad.flush.batch_size = 0;

        assert!(matches!(
            ledger.reload(bad).await,
            Err(LedgerError::Config { .. })
        ));
        ledger
            .engine()
            .deposit(&red(), Decimal::ONE, TransactionReason::AdminGive)
            .unwrap();
        assert!(ledger.shutdown().await.is_clean());
    }

    #[tokio::test]
    async fn test_reload_to_unopenable_backend_keeps_running_ledger() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut ledger = Ledger::start_with_backend(
            LedgerConfig::default(),
            backend.clone(),
            Collaborators::default(),
        )
        .await
        .unwrap();
        ledger
            .engine()
            .deposit(&red(), Decimal::new(3, 0), TransactionReason::AdminGive)
            .unwrap();

        let unreachable = LedgerConfig {
            backend: BackendConfig::Sqlite {
                path: dir.path().join("missing").join("economy.db"),
                pool_size: Some(1),
            },
            ..LedgerConfig::default()
        };
        assert!(matches!(
            ledger.reload(unreachable).await,
            Err(LedgerError::Storage(_))
        ));

        // Still on the original backend, which is open and readable
        assert_eq!(ledger.backend().name(), "memory");
        let blue = Economable::faction("blue").unwrap();
        ledger
            .engine()
            .deposit(&blue, Decimal::ONE, TransactionReason::AdminGive)
            .unwrap();

        assert!(ledger.shutdown().await.is_clean());
        assert_eq!(backend.stored_balance(&red()), Some(Decimal::new(3, 0)));
        assert_eq!(backend.stored_balance(&blue), Some(Decimal::ONE));
    }
}
