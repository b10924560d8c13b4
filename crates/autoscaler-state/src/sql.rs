//! SqlStore: the pool-wide store shared by every pipeline node.
//!
//! Policies, aggregated metrics, cooldowns, and active schedules live in
//! one SQL database reached through sqlx's `Any` driver. Other services
//! write policies, cooldowns, and schedules; the pipeline reads them and
//! owns the `app_metric` table.
//!
//! | table             | columns                                                                 |
//! |-------------------|-------------------------------------------------------------------------|
//! | `policy_json`     | `app_id`, `policy_json`, `guid`                                         |
//! | `app_metric`      | `app_id`, `metric_type`, `unit`, `timestamp`, `value`                   |
//! | `scalingcooldown` | `appid`, `expireat`                                                     |
//! | `activeschedule`  | `appid`, `scheduleid`, `instancemincount`, `instancemaxcount`, `initialmininstancecount` |

use std::time::Duration;

use autoscaler_core::Dialect;
use autoscaler_core::sql::url_scheme;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tracing::debug;

use crate::contracts::{MetricHistory, MetricStore, PolicyStore, ScalingStore, StoreFuture};
use crate::error::{StateError, StateResult};
use crate::types::*;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Statements rendered once for the connected dialect.
#[derive(Debug, Clone)]
struct Statements {
    policies: String,
    insert_policy: String,
    delete_policy: String,
    insert_metric: String,
    metrics_asc: String,
    metrics_desc: String,
    prune_metrics: String,
    cooldown: String,
    delete_cooldown: String,
    insert_cooldown: String,
    schedule: String,
    delete_schedule: String,
    insert_schedule: String,
    schema: Vec<String>,
}

impl Statements {
    fn new(dialect: Dialect) -> Self {
        let p = |n| dialect.param(n);
        let window = format!(
            "SELECT app_id, metric_type, unit, timestamp, value FROM app_metric \
             WHERE app_id = {} AND metric_type = {} AND timestamp >= {} AND timestamp <= {} \
             ORDER BY timestamp",
            p(1),
            p(2),
            p(3),
            p(4)
        );
        Self {
            policies: "SELECT app_id, policy_json, COALESCE(guid, '') FROM policy_json".to_string(),
            insert_policy: format!(
                "INSERT INTO policy_json (app_id, policy_json, guid) VALUES ({})",
                dialect.params(3)
            ),
            delete_policy: format!("DELETE FROM policy_json WHERE app_id = {}", p(1)),
            insert_metric: format!(
                "INSERT INTO app_metric (app_id, metric_type, unit, timestamp, value) VALUES ({})",
                dialect.params(5)
            ),
            metrics_asc: format!("{window} ASC"),
            metrics_desc: format!("{window} DESC"),
            prune_metrics: format!("DELETE FROM app_metric WHERE timestamp < {}", p(1)),
            cooldown: format!("SELECT expireat FROM scalingcooldown WHERE appid = {}", p(1)),
            delete_cooldown: format!("DELETE FROM scalingcooldown WHERE appid = {}", p(1)),
            insert_cooldown: format!(
                "INSERT INTO scalingcooldown (appid, expireat) VALUES ({})",
                dialect.params(2)
            ),
            schedule: format!(
                "SELECT scheduleid, instancemincount, instancemaxcount, initialmininstancecount \
                 FROM activeschedule WHERE appid = {}",
                p(1)
            ),
            delete_schedule: format!("DELETE FROM activeschedule WHERE appid = {}", p(1)),
            insert_schedule: format!(
                "INSERT INTO activeschedule \
                 (appid, scheduleid, instancemincount, instancemaxcount, initialmininstancecount) \
                 VALUES ({})",
                dialect.params(5)
            ),
            schema: schema(dialect),
        }
    }
}

fn schema(dialect: Dialect) -> Vec<String> {
    let text = match dialect {
        Dialect::MySql => "LONGTEXT",
        Dialect::Postgres | Dialect::Sqlite => "TEXT",
    };
    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS policy_json (\
             app_id VARCHAR(255) PRIMARY KEY, policy_json {text} NOT NULL, guid VARCHAR(255))"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS app_metric (\
             app_id VARCHAR(255) NOT NULL, metric_type VARCHAR(255) NOT NULL, \
             unit VARCHAR(255) NOT NULL, timestamp BIGINT NOT NULL, value VARCHAR(255) NOT NULL{})",
            // MySQL has no CREATE INDEX IF NOT EXISTS.
            if dialect == Dialect::MySql {
                ", INDEX idx_app_metric_window (app_id, metric_type, timestamp)"
            } else {
                ""
            }
        ),
        "CREATE TABLE IF NOT EXISTS scalingcooldown (\
         appid VARCHAR(255) PRIMARY KEY, expireat BIGINT NOT NULL)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS activeschedule (\
         appid VARCHAR(255) PRIMARY KEY, scheduleid VARCHAR(255) NOT NULL, \
         instancemincount BIGINT NOT NULL, instancemaxcount BIGINT NOT NULL, \
         initialmininstancecount BIGINT NOT NULL)"
            .to_string(),
    ];
    if dialect != Dialect::MySql {
        statements.push(
            "CREATE INDEX IF NOT EXISTS idx_app_metric_window \
             ON app_metric (app_id, metric_type, timestamp)"
                .to_string(),
        );
    }
    statements
}

/// Shared store over a SQL database.
#[derive(Clone)]
pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
    sql: Statements,
}

impl SqlStore {
    /// Connect to the shared database at `url`.
    pub async fn connect(url: &str, max_connections: u32) -> StateResult<Self> {
        let dialect = Dialect::from_url(url).ok_or_else(|| {
            StateError::Open(format!("unsupported database url scheme {:?}", url_scheme(url)))
        })?;
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(map_err!(Open))?;
        debug!(dialect = ?dialect, "shared state store connected");
        Ok(Self::with_pool(pool, dialect))
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: AnyPool, dialect: Dialect) -> Self {
        Self {
            pool,
            dialect,
            sql: Statements::new(dialect),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Create any missing table. Production schemas are owned by the
    /// services that write policies and cooldowns; this serves tests and
    /// single-database setups.
    pub async fn ensure_schema(&self) -> StateResult<()> {
        for stmt in &self.sql.schema {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(map_err!(Table))?;
        }
        Ok(())
    }

    /// Insert or replace an app's policy record.
    pub async fn put_policy(&self, record: &PolicyJson) -> StateResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err!(Transaction))?;
        sqlx::query(&self.sql.delete_policy)
            .bind(record.app_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_err!(Write))?;
        sqlx::query(&self.sql.insert_policy)
            .bind(record.app_id.as_str())
            .bind(record.policy_json.as_str())
            .bind(record.guid.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_err!(Write))?;
        tx.commit().await.map_err(map_err!(Transaction))?;
        debug!(app_id = %record.app_id, "policy stored");
        Ok(())
    }

    /// Delete an app's policy. Returns true if it existed.
    pub async fn delete_policy(&self, app_id: &str) -> StateResult<bool> {
        let result = sqlx::query(&self.sql.delete_policy)
            .bind(app_id)
            .execute(&self.pool)
            .await
            .map_err(map_err!(Write))?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace an app's active schedule.
    pub async fn put_active_schedule(&self, schedule: &ActiveSchedule) -> StateResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err!(Transaction))?;
        sqlx::query(&self.sql.delete_schedule)
            .bind(schedule.app_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_err!(Write))?;
        sqlx::query(&self.sql.insert_schedule)
            .bind(schedule.app_id.as_str())
            .bind(schedule.schedule_id.as_str())
            .bind(i64::from(schedule.instance_min_count))
            .bind(i64::from(schedule.instance_max_count))
            .bind(i64::from(schedule.instance_min_initial_count))
            .execute(&mut *tx)
            .await
            .map_err(map_err!(Write))?;
        tx.commit().await.map_err(map_err!(Transaction))?;
        debug!(app_id = %schedule.app_id, schedule_id = %schedule.schedule_id, "active schedule stored");
        Ok(())
    }

    /// Delete an app's active schedule. Returns true if it existed.
    pub async fn delete_active_schedule(&self, app_id: &str) -> StateResult<bool> {
        let result = sqlx::query(&self.sql.delete_schedule)
            .bind(app_id)
            .execute(&self.pool)
            .await
            .map_err(map_err!(Write))?;
        Ok(result.rows_affected() > 0)
    }

    async fn policies(&self) -> StateResult<Vec<PolicyJson>> {
        let rows = sqlx::query_as::<_, (String, String, String)>(&self.sql.policies)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err!(Read))?;
        Ok(rows
            .into_iter()
            .map(|(app_id, policy_json, guid)| PolicyJson {
                app_id,
                policy_json,
                guid,
            })
            .collect())
    }

    async fn save_metrics(&self, metrics: &[AppMetric]) -> StateResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(map_err!(Transaction))?;
        for metric in metrics {
            sqlx::query(&self.sql.insert_metric)
                .bind(metric.app_id.as_str())
                .bind(metric.metric_type.as_str())
                .bind(metric.unit.as_str())
                .bind(metric.timestamp)
                .bind(metric.value.as_str())
                .execute(&mut *tx)
                .await
                .map_err(map_err!(Write))?;
        }
        tx.commit().await.map_err(map_err!(Transaction))?;
        debug!(count = metrics.len(), "app metrics stored");
        Ok(())
    }

    async fn metrics(
        &self,
        app_id: &str,
        metric_type: &str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> StateResult<Vec<AppMetric>> {
        if end < start {
            return Ok(Vec::new());
        }
        let stmt = match order {
            OrderType::Asc => &self.sql.metrics_asc,
            OrderType::Desc => &self.sql.metrics_desc,
        };
        let rows = sqlx::query_as::<_, (String, String, String, i64, String)>(stmt)
            .bind(app_id)
            .bind(metric_type)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err!(Read))?;
        Ok(rows
            .into_iter()
            .map(|(app_id, metric_type, unit, timestamp, value)| AppMetric {
                app_id,
                metric_type,
                value,
                unit,
                timestamp,
            })
            .collect())
    }

    async fn prune(&self, before: i64) -> StateResult<u64> {
        let result = sqlx::query(&self.sql.prune_metrics)
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(map_err!(Write))?;
        debug!(before, removed = result.rows_affected(), "app metrics pruned");
        Ok(result.rows_affected())
    }

    async fn cooldown(&self, app_id: &str) -> StateResult<(bool, i64)> {
        let expire_at = sqlx::query_scalar::<_, i64>(&self.sql.cooldown)
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err!(Read))?;
        Ok(match expire_at {
            Some(expire_at) => (expire_at < epoch_nanos(), expire_at),
            None => (true, 0),
        })
    }

    async fn set_cooldown(&self, app_id: &str, expire_at: i64) -> StateResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err!(Transaction))?;
        sqlx::query(&self.sql.delete_cooldown)
            .bind(app_id)
            .execute(&mut *tx)
            .await
            .map_err(map_err!(Write))?;
        sqlx::query(&self.sql.insert_cooldown)
            .bind(app_id)
            .bind(expire_at)
            .execute(&mut *tx)
            .await
            .map_err(map_err!(Write))?;
        tx.commit().await.map_err(map_err!(Transaction))?;
        debug!(%app_id, expire_at, "cooldown updated");
        Ok(())
    }

    async fn schedule(&self, app_id: &str) -> StateResult<Option<ActiveSchedule>> {
        let row = sqlx::query_as::<_, (String, i64, i64, i64)>(&self.sql.schedule)
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err!(Read))?;
        row.map(|(schedule_id, min, max, initial)| -> StateResult<ActiveSchedule> {
            Ok(ActiveSchedule {
                app_id: app_id.to_string(),
                schedule_id,
                instance_min_count: instance_count(app_id, min)?,
                instance_max_count: instance_count(app_id, max)?,
                instance_min_initial_count: instance_count(app_id, initial)?,
            })
        })
        .transpose()
    }
}

fn instance_count(app_id: &str, value: i64) -> StateResult<i32> {
    i32::try_from(value).map_err(|_| {
        StateError::Deserialize(format!("active schedule of {app_id}: instance count {value} out of range"))
    })
}

impl PolicyStore for SqlStore {
    fn retrieve_policies(&self) -> StoreFuture<'_, Vec<PolicyJson>> {
        Box::pin(self.policies())
    }
}

impl MetricStore for SqlStore {
    fn save_app_metrics_in_bulk<'a>(&'a self, metrics: &'a [AppMetric]) -> StoreFuture<'a, ()> {
        Box::pin(self.save_metrics(metrics))
    }

    fn retrieve_app_metrics<'a>(
        &'a self,
        app_id: &'a str,
        metric_type: &'a str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> StoreFuture<'a, Vec<AppMetric>> {
        Box::pin(self.metrics(app_id, metric_type, start, end, order))
    }

    fn prune_app_metrics(&self, before: i64) -> StoreFuture<'_, u64> {
        Box::pin(self.prune(before))
    }
}

impl MetricHistory for SqlStore {
    fn query_app_metrics<'a>(
        &'a self,
        app_id: &'a str,
        metric_type: &'a str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> StoreFuture<'a, Vec<AppMetric>> {
        let end = if end == -1 { epoch_nanos() } else { end };
        Box::pin(self.metrics(app_id, metric_type, start, end, order))
    }
}

impl ScalingStore for SqlStore {
    fn can_scale_app<'a>(&'a self, app_id: &'a str) -> StoreFuture<'a, (bool, i64)> {
        Box::pin(self.cooldown(app_id))
    }

    fn update_scaling_cooldown_expire_time<'a>(
        &'a self,
        app_id: &'a str,
        expire_at: i64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.set_cooldown(app_id, expire_at))
    }

    fn get_active_schedule<'a>(
        &'a self,
        app_id: &'a str,
    ) -> StoreFuture<'a, Option<ActiveSchedule>> {
        Box::pin(self.schedule(app_id))
    }
}
