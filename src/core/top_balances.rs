//! Periodically refreshed leaderboard of the highest balances
//!
//! Reads never touch the backend: they return the last published snapshot,
//! which a refresh replaces wholesale. The snapshot reflects durable state, so
//! balances that have not been flushed yet show up after the next refresh
//! following their flush.

use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::traits::DurableBackend;
use crate::types::{Economable, StorageError};

/// Published leaderboard, highest balance first
pub type TopBalances = Arc<Vec<(Economable, Decimal)>>;

/// One row of a leaderboard page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedBalance {
    /// 1-based position in the whole leaderboard
    pub rank: usize,
    pub economable: Economable,
    pub balance: Decimal,
}

#[derive(Debug)]
pub struct TopBalanceCache {
    backend: Arc<dyn DurableBackend>,
    size: usize,
    snapshot: RwLock<TopBalances>,
    refreshes: AtomicU64,
}

impl TopBalanceCache {
    /// Create an empty cache that fetches `size` entries per refresh
    pub fn new(backend: Arc<dyn DurableBackend>, size: usize) -> Self {
        Self {
            backend,
            size,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            refreshes: AtomicU64::new(0),
        }
    }

    /// The last published leaderboard; empty before the first refresh
    pub fn snapshot(&self) -> TopBalances {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of successful refreshes so far
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Fetch the leaderboard from the backend and publish it
    ///
    /// On failure the previous snapshot stays published.
    ///
    /// # Returns
    ///
    /// The number of entries now published
    pub async fn refresh(&self) -> Result<usize, StorageError> {
        let backend = Arc::clone(&self.backend);
        let size = self.size;
        let result = tokio::task::spawn_blocking(move || backend.top_n(size))
            .await
            .unwrap_or_else(|e| Err(StorageError::unavailable(format!("refresh task failed: {}", e))));

        match result {
            Ok(entries) => {
                let count = entries.len();
                *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(entries);
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                debug!(entries = count, "top balances refreshed");
                Ok(count)
            }
            Err(error) => {
                warn!(%error, "top balance refresh failed, keeping previous snapshot");
                Err(error)
            }
        }
    }

    /// A page of the current snapshot
    ///
    /// `page` is 1-based; page 0 is treated as page 1. A page past the end is
    /// empty.
    pub fn page(&self, page: usize, per_page: usize) -> Vec<RankedBalance> {
        let snapshot = self.snapshot();
        let start = page.saturating_sub(1).saturating_mul(per_page);

        snapshot
            .iter()
            .enumerate()
            .skip(start)
            .take(per_page)
            .map(|(index, (economable, balance))| RankedBalance {
                rank: index + 1,
                economable: economable.clone(),
                balance: *balance,
            })
            .collect()
    }

    /// Refresh now and then every `interval` until the task is aborted
    pub fn spawn_timer(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Failures are logged by refresh; the next tick tries again
                let _ = cache.refresh().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use rstest::rstest;

    fn faction(name: &str) -> Economable {
        Economable::faction(name).unwrap()
    }

    fn seeded() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(&faction("a"), Decimal::new(30, 0));
        backend.seed(&faction("b"), Decimal::new(20, 0));
        backend.seed(&faction("c"), Decimal::new(10, 0));
        backend
    }

    #[tokio::test]
    async fn test_snapshot_is_empty_until_refreshed() {
        let backend = seeded();
        let cache = TopBalanceCache::new(backend, 2);

        assert!(cache.snapshot().is_empty());
        assert_eq!(cache.refresh().await.unwrap(), 2);
        assert_eq!(
            *cache.snapshot(),
            vec![
                (faction("a"), Decimal::new(30, 0)),
                (faction("b"), Decimal::new(20, 0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let backend = seeded();
        let cache = TopBalanceCache::new(backend.clone(), 10);
        cache.refresh().await.unwrap();
        let before = cache.snapshot();

        backend.set_unavailable(true);
        assert!(cache.refresh().await.is_err());

        assert_eq!(cache.snapshot(), before);
        assert_eq!(cache.refresh_count(), 1);
    }

    #[rstest]
    #[case::first_page(1, 2, vec![1, 2])]
    #[case::page_zero_is_first(0, 2, vec![1, 2])]
    #[case::partial_last_page(2, 2, vec![3])]
    #[case::past_the_end(3, 2, vec![])]
    #[tokio::test]
    async fn test_page(#[case] page: usize, #[case] per_page: usize, #[case] ranks: Vec<usize>) {
        let cache = TopBalanceCache::new(seeded(), 10);
        cache.refresh().await.unwrap();

        let got: Vec<usize> = cache.page(page, per_page).iter().map(|r| r.rank).collect();

        assert_eq!(got, ranks);
    }

    #[tokio::test]
    async fn test_timer_refreshes_immediately() {
        let cache = Arc::new(TopBalanceCache::new(seeded(), 10));
        let timer = cache.spawn_timer(Duration::from_secs(3600));

        for _ in 0..200 {
            if cache.refresh_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        timer.abort();

        assert_eq!(cache.refresh_count(), 1);
        assert_eq!(cache.snapshot().len(), 3);
    }
}
