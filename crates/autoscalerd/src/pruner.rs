//! Periodic deletion of old app metrics.
//!
//! A shared store needs only one pruner per pool, so there the pruner
//! follows the lock maintainer's "held" flag. A node-local store is pruned
//! by its own node unconditionally.

use std::sync::Arc;
use std::time::Duration;

use autoscaler_state::{MetricStore, StoreScope, epoch_nanos};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The lock flag a pruner of a store with `scope` must follow, if any.
pub fn prune_gate(
    scope: StoreScope,
    held: Option<watch::Receiver<bool>>,
) -> Option<watch::Receiver<bool>> {
    match scope {
        StoreScope::Shared => held,
        StoreScope::NodeLocal => None,
    }
}

pub struct MetricPruner {
    store: Arc<dyn MetricStore>,
    interval: Duration,
    cutoff: Duration,
    /// `None`: always prune.
    held: Option<watch::Receiver<bool>>,
}

impl MetricPruner {
    pub fn new(
        store: Arc<dyn MetricStore>,
        interval: Duration,
        cutoff: Duration,
        held: Option<watch::Receiver<bool>>,
    ) -> Self {
        Self {
            store,
            interval,
            cutoff,
            held,
        }
    }

    fn may_prune(&self) -> bool {
        self.held.as_ref().is_none_or(|held| *held.borrow())
    }

    /// One pruning pass. `None` when skipped or failed.
    pub async fn prune_once(&self, now: i64) -> Option<u64> {
        if !self.may_prune() {
            debug!("distributed lock not held, skipping metric pruning");
            return None;
        }
        let cutoff = i64::try_from(self.cutoff.as_nanos()).unwrap_or(i64::MAX);
        let before = now.saturating_sub(cutoff);
        match self.store.prune_app_metrics(before).await {
            Ok(removed) => {
                info!(removed, before, "old app metrics pruned");
                Some(removed)
            }
            Err(e) => {
                warn!(before, error = %e, "metric pruning failed");
                None
            }
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.prune_once(epoch_nanos()).await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("metric pruner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use autoscaler_state::{AppMetric, OrderType, StateStore};

    const DAY: i64 = 24 * 3600 * 1_000_000_000;
    const THIRTY_DAYS: Duration = Duration::from_secs(30 * 24 * 3600);

    fn store_with_ages(ages_days: &[i64], now: i64) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        let metrics: Vec<_> = ages_days
            .iter()
            .map(|age| AppMetric {
                app_id: "a1".to_string(),
                metric_type: "mem".to_string(),
                value: age.to_string(),
                unit: "MB".to_string(),
                timestamp: now - age * DAY,
            })
            .collect();
        store.save_app_metrics_in_bulk(&metrics).unwrap();
        store
    }

    fn remaining(store: &StateStore) -> usize {
        store
            .retrieve_app_metrics("a1", "mem", 0, i64::MAX, OrderType::Asc)
            .unwrap()
            .len()
    }

    fn pruner(store: &StateStore, held: Option<watch::Receiver<bool>>) -> MetricPruner {
        MetricPruner::new(
            Arc::new(store.clone()),
            Duration::from_secs(3600),
            THIRTY_DAYS,
            held,
        )
    }

    #[tokio::test]
    async fn prunes_beyond_cutoff_without_lock() {
        let now = epoch_nanos();
        let store = store_with_ages(&[40, 31, 2], now);
        assert_eq!(pruner(&store, None).prune_once(now).await, Some(2));
        assert_eq!(remaining(&store), 1);
    }

    #[tokio::test]
    async fn follows_lock_flag() {
        let now = epoch_nanos();
        let store = store_with_ages(&[40], now);
        let (held_tx, held_rx) = watch::channel(false);
        let pruner = pruner(&store, Some(held_rx));

        assert_eq!(pruner.prune_once(now).await, None);
        assert_eq!(remaining(&store), 1);

        held_tx.send_replace(true);
        assert_eq!(pruner.prune_once(now).await, Some(1));
        assert_eq!(remaining(&store), 0);
    }

    #[tokio::test]
    async fn local_store_is_pruned_while_another_node_holds_the_lock() {
        let now = epoch_nanos();
        let store = store_with_ages(&[90], now);
        let (_held_tx, held_rx) = watch::channel(false);
        let pruner = pruner(&store, prune_gate(StoreScope::NodeLocal, Some(held_rx)));

        for _ in 0..5 {
            pruner.prune_once(now).await;
        }
        assert_eq!(remaining(&store), 0);
    }

    #[tokio::test]
    async fn shared_store_waits_for_the_lock() {
        let (_held_tx, held_rx) = watch::channel(false);
        assert!(prune_gate(StoreScope::Shared, Some(held_rx)).is_some());
        assert!(prune_gate(StoreScope::Shared, None).is_none());
    }

    #[tokio::test]
    async fn huge_cutoff_keeps_everything() {
        let now = epoch_nanos();
        let store = store_with_ages(&[400], now);
        let pruner = MetricPruner::new(
            Arc::new(store.clone()),
            Duration::from_secs(3600),
            Duration::from_secs(u64::MAX),
            None,
        );
        assert_eq!(pruner.prune_once(now).await, Some(0));
        assert_eq!(remaining(&store), 1);
    }
}
