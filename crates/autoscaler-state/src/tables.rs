//! redb table definitions for the state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Policy records keyed by `{app_id}`.
pub const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");

/// Aggregated metrics keyed by `{app_id}|{metric_type}|{timestamp:020}|{seq:010}`.
///
/// The zero-padded timestamp keeps one app+type's samples contiguous and
/// time-ordered, so window queries are plain range scans.
pub const APP_METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("app_metrics");

/// Cooldown records keyed by `{app_id}`.
pub const COOLDOWNS: TableDefinition<&str, &[u8]> = TableDefinition::new("cooldowns");

/// Active schedules keyed by `{app_id}`.
pub const ACTIVE_SCHEDULES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("active_schedules");

/// Shape shared by every table above.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;
