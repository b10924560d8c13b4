//! SQL lock table protocol.
//!
//! The table holds at most one row `(owner, lock_timestamp, ttl)`. Every
//! call runs in its own transaction:
//!
//! 1. take a table lock where the dialect has one that fails fast
//! 2. `SELECT .. FOR UPDATE [NOWAIT]` the row, asking the database
//!    whether `lock_timestamp + ttl` is already in the past
//! 3. no row: insert; own row: renew; stale foreign row: delete and
//!    insert; live foreign row: not acquired
//!
//! Timestamps are always written with the database's own clock.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use autoscaler_core::config::is_sql_identifier;
use autoscaler_core::sql::{Dialect, url_scheme};
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tracing::{debug, info, warn};

use crate::error::{LockError, LockResult};

/// Attempts per call when the connection goes bad mid-transaction.
pub const MAX_ATTEMPTS: u32 = 3;

/// Pause between attempts.
pub const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Postgres SQLSTATE for `lock_not_available`, raised by `NOWAIT`.
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";

/// Boxed future returned by [`DistributedLock`] methods.
pub type LockFuture<'a, T> = Pin<Box<dyn Future<Output = LockResult<T>> + Send + 'a>>;

/// Mutual exclusion across pipeline nodes.
pub trait DistributedLock: Send + Sync {
    /// Acquire or renew the lock for `owner`. `Ok(false)` means another
    /// owner holds a live lock.
    fn lock<'a>(&'a self, owner: &'a str, ttl: Duration) -> LockFuture<'a, bool>;

    /// Drop `owner`'s lock row, if any.
    fn release<'a>(&'a self, owner: &'a str) -> LockFuture<'a, ()>;
}

/// Lock-table SQL fragments for each dialect.
trait LockSql {
    fn now(self) -> &'static str;
    fn expired(self) -> &'static str;
    fn integer_type(self) -> &'static str;
    fn lock_table(self, table: &str) -> Option<String>;
    fn row_lock_clause(self) -> &'static str;
    fn create_table(self, table: &str) -> String;
}

impl LockSql for Dialect {
    /// Current UTC time in the representation stored in `lock_timestamp`.
    fn now(self) -> &'static str {
        match self {
            Dialect::Postgres => "(NOW() AT TIME ZONE 'utc')",
            Dialect::MySql => "UTC_TIMESTAMP(6)",
            Dialect::Sqlite => "julianday('now')",
        }
    }

    /// Boolean expression: the row's ttl has run out on the database clock.
    fn expired(self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "lock_timestamp + ttl * INTERVAL '1 second' < (NOW() AT TIME ZONE 'utc')"
            }
            Dialect::MySql => "TIMESTAMPADD(SECOND, ttl, lock_timestamp) < UTC_TIMESTAMP(6)",
            Dialect::Sqlite => "lock_timestamp + ttl / 86400.0 < julianday('now')",
        }
    }

    fn integer_type(self) -> &'static str {
        match self {
            Dialect::Postgres => "BIGINT",
            Dialect::MySql => "SIGNED",
            Dialect::Sqlite => "INTEGER",
        }
    }

    fn lock_table(self, table: &str) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!(
                "LOCK TABLE {table} IN ACCESS EXCLUSIVE MODE NOWAIT"
            )),
            // LOCK TABLES commits the open transaction in MySQL; SQLite
            // serializes writers on its own.
            Dialect::MySql | Dialect::Sqlite => None,
        }
    }

    fn row_lock_clause(self) -> &'static str {
        match self {
            Dialect::Postgres => " FOR UPDATE NOWAIT",
            Dialect::MySql => " FOR UPDATE",
            Dialect::Sqlite => "",
        }
    }

    fn create_table(self, table: &str) -> String {
        let (ts, ttl) = match self {
            Dialect::Postgres => ("TIMESTAMP", "BIGINT"),
            Dialect::MySql => ("DATETIME(6)", "BIGINT"),
            Dialect::Sqlite => ("REAL", "INTEGER"),
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             owner VARCHAR(255) PRIMARY KEY, \
             lock_timestamp {ts} NOT NULL, \
             ttl {ttl} DEFAULT 0)"
        )
    }
}

/// Pre-rendered statements for one table and dialect.
#[derive(Debug, Clone)]
struct Statements {
    lock_table: Option<String>,
    select: String,
    insert: String,
    renew: String,
    delete: String,
    current_owner: String,
    create_table: String,
}

impl Statements {
    fn new(dialect: Dialect, table: &str) -> Self {
        let p1 = dialect.param(1);
        let p2 = dialect.param(2);
        let now = dialect.now();
        Self {
            lock_table: dialect.lock_table(table),
            select: format!(
                "SELECT owner, CAST(CASE WHEN {expired} THEN 1 ELSE 0 END AS {int}) \
                 FROM {table} LIMIT 1{clause}",
                expired = dialect.expired(),
                int = dialect.integer_type(),
                clause = dialect.row_lock_clause(),
            ),
            insert: format!(
                "INSERT INTO {table} (owner, lock_timestamp, ttl) VALUES ({p1}, {now}, {p2})"
            ),
            renew: format!(
                "UPDATE {table} SET lock_timestamp = {now}, ttl = {p1} WHERE owner = {p2}"
            ),
            delete: format!("DELETE FROM {table} WHERE owner = {p1}"),
            current_owner: format!("SELECT owner FROM {table} LIMIT 1"),
            create_table: dialect.create_table(table),
        }
    }
}

/// [`DistributedLock`] over a SQL table, using sqlx's `Any` driver.
#[derive(Clone)]
pub struct SqlLock {
    pool: AnyPool,
    dialect: Dialect,
    table: String,
    sql: Statements,
}

impl SqlLock {
    /// Connect to the lock database at `url`.
    pub async fn connect(url: &str, table: &str) -> LockResult<Self> {
        let dialect = Dialect::from_url(url)
            .ok_or_else(|| LockError::UnsupportedUrl(url_scheme(url).to_string()))?;
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| LockError::Connect(e.to_string()))?;
        Self::with_pool(pool, dialect, table)
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: AnyPool, dialect: Dialect, table: &str) -> LockResult<Self> {
        if !is_sql_identifier(table) {
            return Err(LockError::InvalidTable(table.to_string()));
        }
        Ok(Self {
            pool,
            dialect,
            table: table.to_string(),
            sql: Statements::new(dialect, table),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the lock table if it is missing.
    pub async fn ensure_table(&self) -> LockResult<()> {
        with_retry("ensure_table", || async move {
            sqlx::query(&self.sql.create_table)
                .execute(&self.pool)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Owner of the lock row, live or stale.
    pub async fn current_owner(&self) -> LockResult<Option<String>> {
        with_retry("current_owner", || async move {
            sqlx::query_scalar::<_, String>(&self.sql.current_owner)
                .fetch_optional(&self.pool)
                .await
        })
        .await
    }

    async fn try_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if let Some(stmt) = &self.sql.lock_table {
            match sqlx::query(stmt).execute(&mut *tx).await {
                Ok(_) => {}
                Err(e) if is_lock_not_available(&e) => {
                    debug!(table = %self.table, %owner, "lock table busy");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        let row = match sqlx::query_as::<_, (String, i64)>(&self.sql.select)
            .fetch_optional(&mut *tx)
            .await
        {
            Ok(row) => row,
            Err(e) if is_lock_not_available(&e) => {
                debug!(table = %self.table, %owner, "lock row busy");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let acquired = match row {
            None => {
                self.insert(&mut tx, owner, ttl_secs).await?;
                info!(table = %self.table, %owner, "lock acquired");
                true
            }
            Some((current, _)) if current == owner => {
                sqlx::query(&self.sql.renew)
                    .bind(ttl_secs)
                    .bind(owner)
                    .execute(&mut *tx)
                    .await?;
                debug!(table = %self.table, %owner, "lock renewed");
                true
            }
            Some((current, expired)) if expired != 0 => {
                sqlx::query(&self.sql.delete)
                    .bind(current.as_str())
                    .execute(&mut *tx)
                    .await?;
                self.insert(&mut tx, owner, ttl_secs).await?;
                warn!(table = %self.table, %owner, previous = %current, "stale lock taken over");
                true
            }
            Some((current, _)) => {
                debug!(table = %self.table, %owner, holder = %current, "lock held elsewhere");
                false
            }
        };

        if acquired {
            tx.commit().await?;
        }
        Ok(acquired)
    }

    async fn insert(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Any>,
        owner: &str,
        ttl_secs: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&self.sql.insert)
            .bind(owner)
            .bind(ttl_secs)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn try_release(&self, owner: &str) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&self.sql.delete)
            .bind(owner)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(table = %self.table, %owner, removed = result.rows_affected(), "lock released");
        Ok(())
    }
}

impl DistributedLock for SqlLock {
    fn lock<'a>(&'a self, owner: &'a str, ttl: Duration) -> LockFuture<'a, bool> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
        Box::pin(with_retry("lock", move || self.try_lock(owner, ttl_secs)))
    }

    fn release<'a>(&'a self, owner: &'a str) -> LockFuture<'a, ()> {
        Box::pin(with_retry("release", move || self.try_release(owner)))
    }
}

/// Run `op`, retrying connection-class failures up to [`MAX_ATTEMPTS`] times.
async fn with_retry<T, F, Fut>(op: &'static str, mut f: F) -> LockResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if is_bad_connection(&e) && attempt < MAX_ATTEMPTS => {
                warn!(op, attempt, error = %e, "lock transaction lost its connection, retrying");
                attempt += 1;
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(e) => {
                return Err(LockError::Database {
                    op,
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
        }
    }
}

fn is_bad_connection(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
    )
}

fn is_lock_not_available(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == PG_LOCK_NOT_AVAILABLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn sqlite_lock(table: &str) -> SqlLock {
        sqlx::any::install_default_drivers();
        // One connection keeps every call on the same in-memory database.
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let lock = SqlLock::with_pool(pool, Dialect::Sqlite, table).unwrap();
        lock.ensure_table().await.unwrap();
        lock
    }

    async fn lock_row(lock: &SqlLock) -> (String, f64, i64) {
        sqlx::query_as::<_, (String, f64, i64)>(&format!(
            "SELECT owner, lock_timestamp, ttl FROM {}",
            lock.table()
        ))
        .fetch_one(&lock.pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn unsupported_url_is_rejected() {
        let err = SqlLock::connect("redis://cache:6379", "operator_lock").await.err();
        assert!(matches!(err, Some(LockError::UnsupportedUrl(scheme)) if scheme == "redis"));
    }

    #[test]
    fn postgres_statements() {
        let sql = Statements::new(Dialect::Postgres, "operator_lock");
        assert_eq!(
            sql.lock_table.as_deref(),
            Some("LOCK TABLE operator_lock IN ACCESS EXCLUSIVE MODE NOWAIT")
        );
        assert!(sql.select.ends_with("FROM operator_lock LIMIT 1 FOR UPDATE NOWAIT"));
        assert!(sql.insert.contains("VALUES ($1, (NOW() AT TIME ZONE 'utc'), $2)"));
        assert_eq!(sql.delete, "DELETE FROM operator_lock WHERE owner = $1");
    }

    #[test]
    fn mysql_statements() {
        let sql = Statements::new(Dialect::MySql, "operator_lock");
        assert!(sql.lock_table.is_none());
        assert!(sql.select.ends_with("LIMIT 1 FOR UPDATE"));
        assert!(sql.select.contains("AS SIGNED"));
        assert!(sql.renew.contains("UTC_TIMESTAMP(6)"));
    }

    #[tokio::test]
    async fn rejects_unsafe_table_name() {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let err = SqlLock::with_pool(pool, Dialect::Sqlite, "lock; DROP TABLE x").err();
        assert!(matches!(err, Some(LockError::InvalidTable(_))));
    }

    #[tokio::test]
    async fn acquire_renew_release() {
        let lock = sqlite_lock("test_lock").await;

        assert!(lock.lock("a", Duration::from_secs(30)).await.unwrap());
        assert!(lock.lock("a", Duration::from_secs(30)).await.unwrap());
        assert_eq!(lock.current_owner().await.unwrap().as_deref(), Some("a"));

        lock.release("a").await.unwrap();
        assert_eq!(lock.current_owner().await.unwrap(), None);
    }

    #[tokio::test]
    async fn contention_is_not_an_error() {
        let lock = sqlite_lock("test_lock").await;

        assert!(lock.lock("a", Duration::from_secs(30)).await.unwrap());
        assert!(!lock.lock("b", Duration::from_secs(30)).await.unwrap());
        assert_eq!(lock.current_owner().await.unwrap().as_deref(), Some("a"));

        // Releasing someone else's lock leaves it in place.
        lock.release("b").await.unwrap();
        assert_eq!(lock.current_owner().await.unwrap().as_deref(), Some("a"));

        lock.release("a").await.unwrap();
        assert!(lock.lock("b", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over_after_ttl() {
        let lock = sqlite_lock("test_lock").await;

        assert!(lock.lock("a", Duration::from_secs(1)).await.unwrap());
        let stamped = lock_row(&lock).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A live row is left exactly as its owner wrote it.
        assert!(!lock.lock("b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(lock_row(&lock).await, stamped);

        tokio::time::sleep(Duration::from_millis(1300)).await;

        assert!(lock.lock("b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(lock.current_owner().await.unwrap().as_deref(), Some("b"));
        // The old owner cannot renew a row it no longer has.
        assert!(!lock.lock("a", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn retries_only_bad_connections() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(sqlx::Error::Io(std::io::Error::other("reset")))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: LockResult<()> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(matches!(result, Err(LockError::Database { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: LockResult<()> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::Io(std::io::Error::other("reset"))) }
        })
        .await;
        assert!(matches!(result, Err(LockError::Database { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
