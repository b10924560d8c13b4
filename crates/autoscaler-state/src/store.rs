//! StateStore: redb-backed persistence for the signal pipeline.
//!
//! Provides typed operations over policies, aggregated app metrics,
//! cooldown records, and active schedules, and implements the pipeline's
//! store contracts. A redb file belongs to one process, so this backend
//! serves single-node deployments and tests; pools share a
//! [`SqlStore`](crate::sql::SqlStore) instead.

use std::future::ready;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::contracts::{MetricHistory, MetricStore, PolicyStore, ScalingStore, StoreFuture};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Maps a backend error onto the named `StateError` variant.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Shared handle to the pipeline database. Clones share one redb instance.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Disambiguates metrics that share app, type, and timestamp.
    seq: Arc<AtomicU32>,
}

impl StateStore {
    /// Opens the database file at `path`, creating it when missing.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Opens a database that lives only as long as this handle.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            seq: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Materializes every table so later read transactions find them.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(POLICIES).map_err(map_err!(Table))?;
        txn.open_table(APP_METRICS).map_err(map_err!(Table))?;
        txn.open_table(COOLDOWNS).map_err(map_err!(Table))?;
        txn.open_table(ACTIVE_SCHEDULES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Policies ───────────────────────────────────────────────────

    /// Insert or replace an app's policy record.
    pub fn put_policy(&self, record: &PolicyJson) -> StateResult<()> {
        self.write_record(POLICIES, &record.app_id, record)?;
        debug!(app_id = %record.app_id, "policy stored");
        Ok(())
    }

    /// Delete an app's policy. Returns true if it existed.
    pub fn delete_policy(&self, app_id: &str) -> StateResult<bool> {
        let existed = self.remove_record(POLICIES, app_id)?;
        debug!(%app_id, existed, "policy deleted");
        Ok(existed)
    }

    // ── Cooldowns ──────────────────────────────────────────────────

    pub fn get_cooldown(&self, app_id: &str) -> StateResult<Option<CooldownRecord>> {
        self.read_record(COOLDOWNS, app_id)
    }

    // ── Active schedules ───────────────────────────────────────────

    pub fn put_active_schedule(&self, schedule: &ActiveSchedule) -> StateResult<()> {
        self.write_record(ACTIVE_SCHEDULES, &schedule.app_id, schedule)?;
        debug!(app_id = %schedule.app_id, schedule_id = %schedule.schedule_id, "active schedule stored");
        Ok(())
    }

    /// Delete an app's active schedule. Returns true if it existed.
    pub fn delete_active_schedule(&self, app_id: &str) -> StateResult<bool> {
        self.remove_record(ACTIVE_SCHEDULES, app_id)
    }

    // ── App metrics ────────────────────────────────────────────────

    /// Delete every app metric with a timestamp before `before_ns`.
    /// Returns the number of rows removed.
    pub fn prune_app_metrics(&self, before_ns: i64) -> StateResult<u64> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(APP_METRICS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let k = key.value();
                if metric_key_timestamp(k).is_some_and(|ts| ts < before_ns) {
                    keys.push(k.to_string());
                }
            }
            keys
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APP_METRICS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(before_ns, removed = keys.len(), "app metrics pruned");
        Ok(keys.len() as u64)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn write_record<T: serde::Serialize>(
        &self,
        def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn read_record<T: serde::de::DeserializeOwned>(
        &self,
        def: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn remove_record(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

fn metric_key(app_id: &str, metric_type: &str, timestamp: i64, seq: u32) -> String {
    format!("{app_id}|{metric_type}|{:020}|{seq:010}", timestamp.max(0))
}

/// Timestamp segment of an `APP_METRICS` key.
fn metric_key_timestamp(key: &str) -> Option<i64> {
    let mut parts = key.rsplitn(3, '|');
    parts.next()?;
    parts.next()?.parse().ok()
}

impl StateStore {
    pub fn retrieve_policies(&self) -> StateResult<Vec<PolicyJson>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POLICIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: PolicyJson =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    pub fn save_app_metrics_in_bulk(&self, metrics: &[AppMetric]) -> StateResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APP_METRICS).map_err(map_err!(Table))?;
            for metric in metrics {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                let key = metric_key(&metric.app_id, &metric.metric_type, metric.timestamp, seq);
                let value = serde_json::to_vec(metric).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = metrics.len(), "app metrics stored");
        Ok(())
    }

    /// Samples with `start <= timestamp <= end`, ordered by timestamp.
    pub fn retrieve_app_metrics(
        &self,
        app_id: &str,
        metric_type: &str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> StateResult<Vec<AppMetric>> {
        if end < start || end < 0 {
            return Ok(Vec::new());
        }
        let lower = metric_key(app_id, metric_type, start, 0);
        let upper = metric_key(app_id, metric_type, end, u32::MAX);

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APP_METRICS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(lower.as_str()..=upper.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let metric: AppMetric =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(metric);
        }
        if order == OrderType::Desc {
            results.reverse();
        }
        Ok(results)
    }

    /// Store-only history: `end == -1` means now.
    pub fn query_app_metrics(
        &self,
        app_id: &str,
        metric_type: &str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> StateResult<Vec<AppMetric>> {
        let end = if end == -1 { epoch_nanos() } else { end };
        self.retrieve_app_metrics(app_id, metric_type, start, end, order)
    }

    pub fn can_scale_app(&self, app_id: &str) -> StateResult<(bool, i64)> {
        match self.get_cooldown(app_id)? {
            Some(record) => Ok((record.expire_at < epoch_nanos(), record.expire_at)),
            None => Ok((true, 0)),
        }
    }

    pub fn update_scaling_cooldown_expire_time(
        &self,
        app_id: &str,
        expire_at: i64,
    ) -> StateResult<()> {
        let record = CooldownRecord {
            app_id: app_id.to_string(),
            expire_at,
        };
        let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
        // Delete and insert in one transaction; the old record is never merged.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(COOLDOWNS).map_err(map_err!(Table))?;
            table.remove(app_id).map_err(map_err!(Write))?;
            table
                .insert(app_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app_id, expire_at, "cooldown updated");
        Ok(())
    }

    pub fn get_active_schedule(&self, app_id: &str) -> StateResult<Option<ActiveSchedule>> {
        self.read_record(ACTIVE_SCHEDULES, app_id)
    }
}

// The embedded database answers synchronously; its futures are ready.

impl PolicyStore for StateStore {
    fn retrieve_policies(&self) -> StoreFuture<'_, Vec<PolicyJson>> {
        Box::pin(ready(StateStore::retrieve_policies(self)))
    }
}

impl MetricStore for StateStore {
    fn save_app_metrics_in_bulk<'a>(&'a self, metrics: &'a [AppMetric]) -> StoreFuture<'a, ()> {
        Box::pin(ready(StateStore::save_app_metrics_in_bulk(self, metrics)))
    }

    fn retrieve_app_metrics<'a>(
        &'a self,
        app_id: &'a str,
        metric_type: &'a str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> StoreFuture<'a, Vec<AppMetric>> {
        Box::pin(ready(StateStore::retrieve_app_metrics(
            self,
            app_id,
            metric_type,
            start,
            end,
            order,
        )))
    }

    fn prune_app_metrics(&self, before: i64) -> StoreFuture<'_, u64> {
        Box::pin(ready(StateStore::prune_app_metrics(self, before)))
    }
}

impl MetricHistory for StateStore {
    fn query_app_metrics<'a>(
        &'a self,
        app_id: &'a str,
        metric_type: &'a str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> StoreFuture<'a, Vec<AppMetric>> {
        Box::pin(ready(StateStore::query_app_metrics(
            self,
            app_id,
            metric_type,
            start,
            end,
            order,
        )))
    }
}

impl ScalingStore for StateStore {
    fn can_scale_app<'a>(&'a self, app_id: &'a str) -> StoreFuture<'a, (bool, i64)> {
        Box::pin(ready(StateStore::can_scale_app(self, app_id)))
    }

    fn update_scaling_cooldown_expire_time<'a>(
        &'a self,
        app_id: &'a str,
        expire_at: i64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(ready(StateStore::update_scaling_cooldown_expire_time(
            self, app_id, expire_at,
        )))
    }

    fn get_active_schedule<'a>(
        &'a self,
        app_id: &'a str,
    ) -> StoreFuture<'a, Option<ActiveSchedule>> {
        Box::pin(ready(StateStore::get_active_schedule(self, app_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(app_id: &str, metric_type: &str, value: &str, timestamp: i64) -> AppMetric {
        AppMetric {
            app_id: app_id.to_string(),
            metric_type: metric_type.to_string(),
            value: value.to_string(),
            unit: "MB".to_string(),
            timestamp,
        }
    }

    fn policy_record(app_id: &str) -> PolicyJson {
        PolicyJson {
            app_id: app_id.to_string(),
            policy_json: r#"{"instance_min_count":1,"instance_max_count":3,"scaling_rules":[]}"#
                .to_string(),
            guid: format!("guid-{app_id}"),
        }
    }

    // ── Policies ───────────────────────────────────────────────────

    #[test]
    fn policy_put_and_retrieve() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_policy(&policy_record("a1")).unwrap();
        store.put_policy(&policy_record("a2")).unwrap();

        let mut all = store.retrieve_policies().unwrap();
        all.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        assert_eq!(all, vec![policy_record("a1"), policy_record("a2")]);
    }

    #[test]
    fn policy_replace_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = policy_record("a1");
        store.put_policy(&record).unwrap();
        record.guid = "guid-2".to_string();
        store.put_policy(&record).unwrap();

        let all = store.retrieve_policies().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].guid, "guid-2");

        assert!(store.delete_policy("a1").unwrap());
        assert!(!store.delete_policy("a1").unwrap());
        assert!(store.retrieve_policies().unwrap().is_empty());
    }

    // ── App metrics ────────────────────────────────────────────────

    #[test]
    fn metrics_window_is_inclusive_and_filtered() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_app_metrics_in_bulk(&[
                metric("a1", "mem", "10", 100),
                metric("a1", "mem", "20", 200),
                metric("a1", "mem", "30", 300),
                metric("a1", "cpu", "99", 200),
                metric("a2", "mem", "77", 200),
            ])
            .unwrap();

        let got = store
            .retrieve_app_metrics("a1", "mem", 200, 300, OrderType::Asc)
            .unwrap();
        let values: Vec<_> = got.iter().map(|m| m.value.as_str()).collect();
        assert_eq!(values, ["20", "30"]);

        let desc = store
            .retrieve_app_metrics("a1", "mem", 0, 1000, OrderType::Desc)
            .unwrap();
        let values: Vec<_> = desc.iter().map(|m| m.value.as_str()).collect();
        assert_eq!(values, ["30", "20", "10"]);
    }

    #[test]
    fn metrics_with_same_timestamp_are_all_kept() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_app_metrics_in_bulk(&[metric("a1", "mem", "1", 500), metric("a1", "mem", "2", 500)])
            .unwrap();
        store
            .save_app_metrics_in_bulk(&[metric("a1", "mem", "3", 500)])
            .unwrap();

        let got = store
            .retrieve_app_metrics("a1", "mem", 500, 500, OrderType::Asc)
            .unwrap();
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn metric_type_prefix_does_not_leak() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_app_metrics_in_bulk(&[metric("a1", "mem", "1", 10), metric("a1", "memoryused", "2", 10)])
            .unwrap();

        let got = store
            .retrieve_app_metrics("a1", "mem", 0, 100, OrderType::Asc)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, "1");
    }

    #[test]
    fn empty_or_inverted_window() {
        let store = StateStore::open_in_memory().unwrap();
        store.save_app_metrics_in_bulk(&[]).unwrap();
        store
            .save_app_metrics_in_bulk(&[metric("a1", "mem", "1", 10)])
            .unwrap();
        assert!(store
            .retrieve_app_metrics("a1", "mem", 20, 10, OrderType::Asc)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn history_open_end_means_now() {
        let store = StateStore::open_in_memory().unwrap();
        let now = epoch_nanos();
        store
            .save_app_metrics_in_bulk(&[metric("a1", "mem", "1", now - 1_000)])
            .unwrap();
        let got = store
            .query_app_metrics("a1", "mem", 0, -1, OrderType::Asc)
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn prune_removes_old_metrics_only() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_app_metrics_in_bulk(&[
                metric("a1", "mem", "1", 100),
                metric("a2", "cpu", "2", 150),
                metric("a1", "mem", "3", 300),
            ])
            .unwrap();

        assert_eq!(store.prune_app_metrics(200).unwrap(), 2);
        let left = store
            .retrieve_app_metrics("a1", "mem", 0, i64::MAX, OrderType::Asc)
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, 300);
        assert_eq!(store.prune_app_metrics(200).unwrap(), 0);
    }

    #[test]
    fn key_timestamp_parses_from_the_right() {
        let key = metric_key("a|b", "mem", 42, 7);
        assert_eq!(metric_key_timestamp(&key), Some(42));
    }

    // ── Scaling state ──────────────────────────────────────────────

    #[test]
    fn can_scale_without_cooldown() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.can_scale_app("a1").unwrap(), (true, 0));
    }

    #[test]
    fn cooldown_gates_until_expiry() {
        let store = StateStore::open_in_memory().unwrap();
        let future = epoch_nanos() + 60_000_000_000;
        store.update_scaling_cooldown_expire_time("a1", future).unwrap();
        assert_eq!(store.can_scale_app("a1").unwrap(), (false, future));

        let past = epoch_nanos() - 1;
        store.update_scaling_cooldown_expire_time("a1", past).unwrap();
        assert_eq!(store.can_scale_app("a1").unwrap(), (true, past));
        assert_eq!(store.get_cooldown("a1").unwrap().unwrap().expire_at, past);
    }

    #[test]
    fn active_schedule_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_active_schedule("a1").unwrap().is_none());

        let schedule = ActiveSchedule {
            app_id: "a1".to_string(),
            schedule_id: "s1".to_string(),
            instance_min_count: 2,
            instance_max_count: 8,
            instance_min_initial_count: 4,
        };
        store.put_active_schedule(&schedule).unwrap();
        assert_eq!(store.get_active_schedule("a1").unwrap(), Some(schedule));

        assert!(store.delete_active_schedule("a1").unwrap());
        assert!(store.get_active_schedule("a1").unwrap().is_none());
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.put_policy(&policy_record("a1")).unwrap();
            store
                .save_app_metrics_in_bulk(&[metric("a1", "mem", "5", 10)])
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.retrieve_policies().unwrap().len(), 1);
        assert_eq!(
            store
                .retrieve_app_metrics("a1", "mem", 0, 100, OrderType::Asc)
                .unwrap()
                .len(),
            1
        );
    }
}
