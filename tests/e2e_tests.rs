//! End-to-end integration tests
//!
//! These tests drive complete ledgers through their public API:
//! 1. Start a ledger on a real or in-memory backend
//! 2. Apply transactions through the engine
//! 3. Flush, restart or sync, and check what every side observes
//!
//! Scenarios covered:
//! - Conservation of funds across flush and restart, per backend
//! - Flush barrier and write coalescing
//! - Permanent write failures and their later recovery
//! - Two servers sharing one store, kept in sync over a relay once writes
//!   are durable
//! - Leaderboard refresh from durable state

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use rust_decimal::Decimal;
    use saneledger::backend::MemoryBackend;
    use saneledger::config::{BackendConfig, LedgerConfig};
    use saneledger::core::{DurableBackend, PresenceOracle, RelayTransport};
    use saneledger::sync::ChannelRelay;
    use saneledger::{Collaborators, Economable, Ledger, LedgerError, TransactionReason};
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn faction(name: &str) -> Economable {
        Economable::faction(name).unwrap()
    }

    fn player(n: u128) -> Economable {
        Economable::player(Uuid::from_u128(n))
    }

    fn backend_config(kind: &str, dir: &TempDir) -> BackendConfig {
        match kind {
            "flatfile" => BackendConfig::Flatfile {
                path: dir.path().join("economy.csv"),
            },
            "sqlite" => BackendConfig::Sqlite {
                path: dir.path().join("economy.db"),
                pool_size: Some(2),
            },
            _ => panic!("Unknown backend kind: {}", kind),
        }
    }

    async fn on_memory(backend: &Arc<MemoryBackend>, config: LedgerConfig) -> Ledger {
        Ledger::start_with_backend(config, backend.clone(), Collaborators::default())
            .await
            .unwrap()
    }

    fn total(ledger: &Ledger, accounts: &[Economable]) -> Decimal {
        accounts
            .iter()
            .map(|a| ledger.engine().balance(a).unwrap())
            .sum()
    }

    #[rstest]
    #[tokio::test]
    async fn test_conservation_across_flush_and_restart(
        #[values("flatfile", "sqlite")] kind: &str,
    ) {
        let dir = TempDir::new().unwrap();
        let config = LedgerConfig {
            backend: backend_config(kind, &dir),
            ..LedgerConfig::default()
        };
        let accounts: Vec<Economable> = ["a", "b", "c", "d", "e"].into_iter().map(faction).collect();

        let ledger = Ledger::start(config.clone(), Collaborators::default()).await.unwrap();
        for account in &accounts {
            ledger
                .engine()
                .deposit(account, Decimal::new(2000, 2), TransactionReason::StartingBalance)
                .unwrap();
        }
        let mut rejected = 0;
        for step in 0..300_i64 {
            let sender = &accounts[(step % 5) as usize];
            let receiver = &accounts[((step * 3 + 2) % 5) as usize];
            let amount = Decimal::new(step * 53 % 3000 + 1, 2);
            match ledger
                .engine()
                .transfer(sender, receiver, amount, TransactionReason::PlayerPay)
            {
                Ok(_) => {}
                Err(LedgerError::InsufficientFunds { .. }) | Err(LedgerError::SelfTransfer { .. }) => {
                    rejected += 1
                }
                Err(e) => panic!("unexpected rejection: {}", e),
            }
        }
        assert!(rejected > 0);
        assert_eq!(total(&ledger, &accounts), Decimal::new(10000, 2));
        let before: Vec<Decimal> = accounts
            .iter()
            .map(|a| ledger.engine().balance(a).unwrap())
            .collect();

        let report = ledger.shutdown().await;
        assert!(report.is_clean());

        let restarted = Ledger::start(config, Collaborators::default()).await.unwrap();
        let after: Vec<Decimal> = accounts
            .iter()
            .map(|a| restarted.engine().balance(a).unwrap())
            .collect();
        assert_eq!(after, before);
        assert_eq!(total(&restarted, &accounts), Decimal::new(10000, 2));
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_makes_backend_match_memory() {
        let backend = Arc::new(MemoryBackend::new());
        let ledger = on_memory(&backend, LedgerConfig::default()).await;
        let a = faction("a");
        let b = faction("b");

        ledger
            .engine()
            .deposit(&a, Decimal::new(100, 0), TransactionReason::StartingBalance)
            .unwrap();
        ledger
            .engine()
            .transfer(&a, &b, Decimal::new(30, 0), TransactionReason::PlayerPay)
            .unwrap();
        let rejected = ledger
            .engine()
            .transfer(&b, &a, Decimal::new(50, 0), TransactionReason::PlayerPay);
        assert!(matches!(rejected, Err(LedgerError::InsufficientFunds { .. })));

        let report = ledger.flush().await;

        assert!(report.is_clean());
        for (account, expected) in [(&a, Decimal::new(70, 0)), (&b, Decimal::new(30, 0))] {
            assert_eq!(ledger.engine().balance(account).unwrap(), expected);
            assert_eq!(backend.load_one(account).unwrap().unwrap().balance, expected);
        }
        assert!(ledger.store().dirty_economables().is_empty());
        ledger.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeated_mutations_are_written_once() {
        let backend = Arc::new(MemoryBackend::new());
        let ledger = on_memory(&backend, LedgerConfig::default()).await;

        for _ in 0..10 {
            ledger
                .engine()
                .deposit(&faction("a"), Decimal::ONE, TransactionReason::PluginGive)
                .unwrap();
        }
        let report = ledger.flush().await;

        assert_eq!(report.persisted, 1);
        assert_eq!(backend.write_count(), 1);
        assert_eq!(backend.stored_balance(&faction("a")), Some(Decimal::TEN));
        ledger.shutdown().await;
    }

    #[tokio::test]
    async fn test_permanent_failure_is_reported_then_recovered() {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = LedgerConfig::default();
        config.flush.max_attempts = 2;
        config.flush.backoff_ms = 1;
        let ledger = on_memory(&backend, config).await;

        backend.fail_next_writes(2);
        ledger
            .engine()
            .deposit(&faction("a"), Decimal::new(40, 0), TransactionReason::AdminGive)
            .unwrap();

        let failed = ledger.flush().await;
        assert_eq!(failed.failures.len(), 1);
        assert_eq!(failed.failures[0].economable, faction("a"));
        assert_eq!(backend.stored_balance(&faction("a")), None);
        assert_eq!(ledger.engine().balance(&faction("a")).unwrap(), Decimal::new(40, 0));

        let recovered = ledger.flush().await;
        assert!(recovered.is_clean());
        assert_eq!(backend.stored_balance(&faction("a")), Some(Decimal::new(40, 0)));
        ledger.shutdown().await;
    }

    struct Present(Vec<Economable>);

    impl PresenceOracle for Present {
        fn is_present(&self, economable: &Economable) -> bool {
            self.0.contains(economable)
        }
    }

    async fn sync_ledger(
        backend: &Arc<MemoryBackend>,
        present: Vec<Economable>,
    ) -> (Ledger, tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>) {
        let (relay, outbound) = ChannelRelay::new();
        let config = LedgerConfig {
            multi_server_sync: true,
            ..LedgerConfig::default()
        };
        let transport: Arc<dyn RelayTransport> = Arc::new(relay);
        let ledger = Ledger::start_with_backend(
            config,
            backend.clone(),
            Collaborators {
                presence: Arc::new(Present(present)),
                transport: Some(transport),
                subscribers: Vec::new(),
            },
        )
        .await
        .unwrap();
        (ledger, outbound)
    }

    #[tokio::test]
    async fn test_two_servers_converge_through_relay() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = player(1);
        let bob = player(2);
        // Alice is online on server A, Bob on server B
        let (server_a, mut from_a) = sync_ledger(&backend, vec![alice.clone()]).await;
        let (server_b, _from_b) = sync_ledger(&backend, vec![bob.clone()]).await;

        server_a
            .engine()
            .deposit(&alice, Decimal::new(100, 0), TransactionReason::StartingBalance)
            .unwrap();
        // Server B has Bob cached at zero
        assert_eq!(server_b.engine().balance(&bob).unwrap(), Decimal::ZERO);

        server_a
            .engine()
            .transfer(&alice, &bob, Decimal::new(25, 0), TransactionReason::PlayerPay)
            .unwrap();

        // Nothing is announced before the write is durable, so B cannot
        // reload a balance older than the transfer
        assert!(from_a.try_recv().is_err());
        assert_eq!(backend.stored_balance(&bob), None);

        assert!(server_a.flush().await.is_clean());

        // Only Bob is absent from A, so exactly one invalidation went out
        let mut frames = Vec::new();
        while let Ok(frame) = from_a.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 1);

        let reloaded = server_b.handle_relay_frame(&frames[0]).unwrap();
        assert_eq!(reloaded.economable, bob);
        assert_eq!(server_b.engine().balance(&bob).unwrap(), Decimal::new(25, 0));

        server_a.shutdown().await;
        server_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_relay_listener_reloads_in_background() {
        let backend = Arc::new(MemoryBackend::new());
        let bob = player(2);
        let (server_a, mut from_a) = sync_ledger(&backend, Vec::new()).await;
        let (mut server_b, _from_b) = sync_ledger(&backend, Vec::new()).await;
        server_b.engine().balance(&bob).unwrap();

        server_a
            .engine()
            .deposit(&bob, Decimal::new(9, 0), TransactionReason::AdminGive)
            .unwrap();
        server_a.flush().await;

        let (forward, inbound) = tokio::sync::mpsc::unbounded_channel();
        assert!(server_b.spawn_relay_listener(inbound));
        while let Ok(frame) = from_a.try_recv() {
            forward.send(frame).unwrap();
        }

        let mut balance = Decimal::ZERO;
        for _ in 0..200 {
            balance = server_b.engine().balance(&bob).unwrap();
            if balance == Decimal::new(9, 0) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(balance, Decimal::new(9, 0));

        server_a.shutdown().await;
        server_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_leaderboard_reflects_flushed_balances() {
        let backend = Arc::new(MemoryBackend::new());
        let ledger = on_memory(&backend, LedgerConfig::default()).await;
        for (name, amount) in [("a", 5), ("b", 50), ("c", 20)] {
            ledger
                .engine()
                .deposit(&faction(name), Decimal::new(amount, 0), TransactionReason::AdminGive)
                .unwrap();
        }

        ledger.flush().await;
        ledger.refresh_top_balances().await.unwrap();

        let page: Vec<(usize, String)> = ledger
            .top_balances()
            .page(1, 2)
            .into_iter()
            .map(|row| (row.rank, row.economable.to_string()))
            .collect();
        assert_eq!(
            page,
            vec![(1, "faction:b".to_string()), (2, "faction:c".to_string())]
        );
        ledger.shutdown().await;
    }
}
