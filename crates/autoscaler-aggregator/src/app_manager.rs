//! AppManager: node-local view of owned apps and their recent metrics.
//!
//! Every refresh reloads the full policy set, keeps the policies this node
//! is responsible for, and rebuilds cache membership to match: caches of
//! apps that left the shard are dropped, newly owned apps get an empty
//! cache, and caches of still-owned apps are left alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use autoscaler_core::Shard;
use autoscaler_state::*;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::MetricCache;

pub struct AppManager {
    policy_store: Arc<dyn PolicyStore>,
    metric_store: Arc<dyn MetricStore>,
    shard: Shard,
    cache_size: usize,
    poll_interval: Duration,
    /// Owned policies: app_id → policy.
    policies: RwLock<HashMap<AppId, Policy>>,
    /// Per-app caches; keys always match `policies`.
    caches: RwLock<HashMap<AppId, Arc<Mutex<MetricCache>>>>,
}

impl AppManager {
    pub fn new(
        policy_store: Arc<dyn PolicyStore>,
        metric_store: Arc<dyn MetricStore>,
        shard: Shard,
        cache_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            policy_store,
            metric_store,
            shard,
            cache_size,
            poll_interval,
            policies: RwLock::new(HashMap::new()),
            caches: RwLock::new(HashMap::new()),
        }
    }

    pub fn shard(&self) -> Shard {
        self.shard
    }

    /// Reload policies and rebuild cache membership. Returns the number of
    /// owned policies. On error nothing is changed.
    pub async fn refresh(&self) -> StateResult<usize> {
        let rows = self.policy_store.retrieve_policies().await?;
        let total = rows.len();

        let mut owned = HashMap::new();
        for row in rows {
            if !self.shard.owns(&row.app_id) {
                continue;
            }
            match row.parse() {
                Ok(policy) => {
                    owned.insert(row.app_id, policy);
                }
                Err(e) => {
                    error!(app_id = %row.app_id, guid = %row.guid, error = %e, "skipping unparsable policy");
                }
            }
        }
        let count = owned.len();

        // Cache membership is rebuilt while the policy lock is held so no
        // cache outlives its policy.
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        *policies = owned;
        {
            let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
            caches.retain(|app_id, _| policies.contains_key(app_id));
            for app_id in policies.keys() {
                caches
                    .entry(app_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(MetricCache::new(self.cache_size))));
            }
        }
        drop(policies);

        debug!(
            total,
            owned = count,
            node_index = self.shard.node_index(),
            node_count = self.shard.node_count(),
            "policies refreshed"
        );
        Ok(count)
    }

    /// Snapshot of the owned policies.
    pub fn policies(&self) -> HashMap<AppId, Policy> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn policy(&self, app_id: &str) -> Option<Policy> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_id)
            .cloned()
    }

    pub fn has_cache(&self, app_id: &str) -> bool {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(app_id)
    }

    fn cache(&self, app_id: &str) -> Option<Arc<Mutex<MetricCache>>> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_id)
            .cloned()
    }

    /// Cache a freshly aggregated metric. Returns false, without caching,
    /// when this node does not own the app.
    pub fn save_metric_to_cache(&self, metric: &AppMetric) -> bool {
        let Some(cache) = self.cache(&metric.app_id) else {
            debug!(app_id = %metric.app_id, "metric for app outside this shard not cached");
            return false;
        };
        let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.put(metric.clone());
        true
    }

    /// Refresh every `poll_interval` until shutdown. Fetch failures skip
    /// the cycle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            node_index = self.shard.node_index(),
            node_count = self.shard.node_count(),
            "app manager started"
        );

        loop {
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "failed to retrieve policies, keeping previous set");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!("app manager shutting down");
                    break;
                }
            }
        }
    }
}

impl AppManager {
    /// Cached samples when the cache covers the window, else `None`.
    fn cached_window(
        &self,
        app_id: &str,
        metric_type: &str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> Option<Vec<AppMetric>> {
        let cache = self.cache(app_id)?;
        let mut samples = cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .query(start, end.saturating_add(1), metric_type)?;
        debug!(%app_id, %metric_type, start, end, count = samples.len(), "metric cache hit");
        if order == OrderType::Desc {
            samples.reverse();
        }
        Some(samples)
    }
}

impl MetricHistory for AppManager {
    fn query_app_metrics<'a>(
        &'a self,
        app_id: &'a str,
        metric_type: &'a str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> StoreFuture<'a, Vec<AppMetric>> {
        let end = if end == -1 { epoch_nanos() } else { end };
        Box::pin(async move {
            if let Some(samples) = self.cached_window(app_id, metric_type, start, end, order) {
                return Ok(samples);
            }
            debug!(%app_id, %metric_type, start, end, "metric cache miss, reading store");
            self.metric_store
                .retrieve_app_metrics(app_id, metric_type, start, end, order)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"{"instance_min_count":1,"instance_max_count":5,"scaling_rules":[
        {"metric_type":"mem","threshold":30,"operator":"<","adjustment":"-1"}]}"#;

    /// Policy store whose contents and availability the test controls.
    #[derive(Default)]
    struct FakePolicies {
        rows: Mutex<Vec<PolicyJson>>,
        fail: Mutex<bool>,
    }

    impl FakePolicies {
        fn set(&self, app_ids: &[&str]) {
            *self.rows.lock().unwrap() = app_ids
                .iter()
                .map(|id| PolicyJson {
                    app_id: id.to_string(),
                    policy_json: POLICY.to_string(),
                    guid: format!("g-{id}"),
                })
                .collect();
        }
    }

    impl PolicyStore for FakePolicies {
        fn retrieve_policies(&self) -> StoreFuture<'_, Vec<PolicyJson>> {
            let result = if *self.fail.lock().unwrap() {
                Err(StateError::Read("policy db down".to_string()))
            } else {
                Ok(self.rows.lock().unwrap().clone())
            };
            Box::pin(std::future::ready(result))
        }
    }

    fn manager(policies: Arc<FakePolicies>, store: StateStore, shard: Shard) -> AppManager {
        AppManager::new(policies, Arc::new(store), shard, 10, Duration::from_secs(40))
    }

    fn metric(app_id: &str, value: &str, timestamp: i64) -> AppMetric {
        AppMetric {
            app_id: app_id.to_string(),
            metric_type: "mem".to_string(),
            value: value.to_string(),
            unit: "MB".to_string(),
            timestamp,
        }
    }

    #[tokio::test]
    async fn refresh_tracks_policy_set() {
        let policies = Arc::new(FakePolicies::default());
        let am = manager(policies.clone(), StateStore::open_in_memory().unwrap(), Shard::single());

        policies.set(&["a1", "a2"]);
        assert_eq!(am.refresh().await.unwrap(), 2);
        assert!(am.has_cache("a1"));
        assert!(am.save_metric_to_cache(&metric("a1", "10", epoch_nanos())));

        policies.set(&["a2"]);
        am.refresh().await.unwrap();
        assert!(!am.has_cache("a1"));
        assert!(!am.save_metric_to_cache(&metric("a1", "10", epoch_nanos())));
        assert!(am.policy("a1").is_none());
        assert!(am.policy("a2").is_some());
    }

    #[tokio::test]
    async fn refresh_keeps_existing_cache_contents() {
        let policies = Arc::new(FakePolicies::default());
        let am = manager(policies.clone(), StateStore::open_in_memory().unwrap(), Shard::single());
        policies.set(&["a1"]);
        am.refresh().await.unwrap();

        let start = epoch_nanos();
        am.save_metric_to_cache(&metric("a1", "10", start + 1));
        am.refresh().await.unwrap();

        let got = am
            .query_app_metrics("a1", "mem", start, -1, OrderType::Asc)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_changes_nothing() {
        let policies = Arc::new(FakePolicies::default());
        let am = manager(policies.clone(), StateStore::open_in_memory().unwrap(), Shard::single());
        policies.set(&["a1"]);
        am.refresh().await.unwrap();

        *policies.fail.lock().unwrap() = true;
        policies.set(&[]);
        assert!(am.refresh().await.is_err());
        assert!(am.has_cache("a1"));
        assert_eq!(am.policies().len(), 1);
    }

    #[tokio::test]
    async fn unparsable_policy_is_skipped() {
        let policies = Arc::new(FakePolicies::default());
        policies.set(&["a1"]);
        policies.rows.lock().unwrap().push(PolicyJson {
            app_id: "bad".to_string(),
            policy_json: "{not json".to_string(),
            guid: "g".to_string(),
        });
        let am = manager(policies, StateStore::open_in_memory().unwrap(), Shard::single());

        assert_eq!(am.refresh().await.unwrap(), 1);
        assert!(!am.has_cache("bad"));
    }

    #[tokio::test]
    async fn shards_partition_apps_without_overlap() {
        let policies = Arc::new(FakePolicies::default());
        let ids: Vec<String> = (0..50).map(|i| format!("app-{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        policies.set(&refs);

        let managers: Vec<AppManager> = (0..3)
            .map(|i| manager(policies.clone(), StateStore::open_in_memory().unwrap(), Shard::new(3, i)))
            .collect();
        let mut counts = Vec::new();
        for m in &managers {
            counts.push(m.refresh().await.unwrap());
        }
        assert_eq!(counts.iter().sum::<usize>(), 50);

        for id in &ids {
            let owners = managers.iter().filter(|m| m.has_cache(id)).count();
            assert_eq!(owners, 1, "{id} owned by {owners} nodes");
        }
    }

    #[tokio::test]
    async fn query_prefers_cache_and_orders() {
        let policies = Arc::new(FakePolicies::default());
        let store = StateStore::open_in_memory().unwrap();
        let am = manager(policies.clone(), store.clone(), Shard::single());
        policies.set(&["a1"]);
        am.refresh().await.unwrap();

        let start = epoch_nanos();
        for (i, v) in ["1", "2", "3"].iter().enumerate() {
            am.save_metric_to_cache(&metric("a1", v, start + i as i64 + 1));
        }

        // Nothing in the store, so these can only come from the cache.
        let asc = am
            .query_app_metrics("a1", "mem", start, start + 10, OrderType::Asc)
            .await
            .unwrap();
        let asc: Vec<_> = asc.iter().map(|m| m.value.as_str()).collect();
        assert_eq!(asc, ["1", "2", "3"]);

        let desc = am
            .query_app_metrics("a1", "mem", start, start + 10, OrderType::Desc)
            .await
            .unwrap();
        let desc: Vec<_> = desc.iter().map(|m| m.value.as_str()).collect();
        assert_eq!(desc, ["3", "2", "1"]);

        // The end bound is inclusive.
        let upto = am
            .query_app_metrics("a1", "mem", start, start + 2, OrderType::Asc)
            .await
            .unwrap();
        assert_eq!(upto.len(), 2);
    }

    #[tokio::test]
    async fn query_falls_through_to_store() {
        let policies = Arc::new(FakePolicies::default());
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_app_metrics_in_bulk(&[metric("a1", "42", 1_000), metric("other", "7", 1_000)])
            .unwrap();
        let am = manager(policies.clone(), store, Shard::single());
        policies.set(&["a1"]);
        am.refresh().await.unwrap();

        // Window reaches back before the cache existed.
        let got = am
            .query_app_metrics("a1", "mem", 0, -1, OrderType::Asc)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, "42");

        // Unowned app: no cache at all.
        let got = am
            .query_app_metrics("other", "mem", 0, 2_000, OrderType::Asc)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn run_refreshes_until_shutdown() {
        let policies = Arc::new(FakePolicies::default());
        policies.set(&["a1"]);
        let am = Arc::new(manager(policies, StateStore::open_in_memory().unwrap(), Shard::single()));
        let (tx, rx) = watch::channel(false);

        let task = {
            let am = am.clone();
            tokio::spawn(async move { am.run(rx).await })
        };
        for _ in 0..50 {
            if am.has_cache("a1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(am.has_cache("a1"));

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
