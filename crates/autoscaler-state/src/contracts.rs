//! Narrow store contracts consumed by the pipeline.
//!
//! Methods return boxed futures so the contracts stay object safe and a
//! networked SQL backend can sit behind them. The embedded redb backend
//! resolves its futures without awaiting anything.

use std::future::Future;
use std::pin::Pin;

use crate::error::StateResult;
use crate::types::{ActiveSchedule, AppMetric, OrderType, PolicyJson};

/// Boxed future returned by every store contract method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StateResult<T>> + Send + 'a>>;

/// Source of the full policy set.
pub trait PolicyStore: Send + Sync {
    fn retrieve_policies(&self) -> StoreFuture<'_, Vec<PolicyJson>>;
}

/// Durable store of aggregated app metrics.
pub trait MetricStore: Send + Sync {
    fn save_app_metrics_in_bulk<'a>(&'a self, metrics: &'a [AppMetric]) -> StoreFuture<'a, ()>;

    /// Samples with `start <= timestamp <= end`, ordered by timestamp.
    fn retrieve_app_metrics<'a>(
        &'a self,
        app_id: &'a str,
        metric_type: &'a str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> StoreFuture<'a, Vec<AppMetric>>;

    /// Delete every sample older than `before` (ns). Returns the number removed.
    fn prune_app_metrics(&self, before: i64) -> StoreFuture<'_, u64>;
}

/// Read-side view of metric history, cache first.
pub trait MetricHistory: Send + Sync {
    /// Samples in `[start, end]`. `end == -1` means now.
    fn query_app_metrics<'a>(
        &'a self,
        app_id: &'a str,
        metric_type: &'a str,
        start: i64,
        end: i64,
        order: OrderType,
    ) -> StoreFuture<'a, Vec<AppMetric>>;
}

/// Cooldown and schedule state consulted before scaling.
pub trait ScalingStore: Send + Sync {
    /// `(allowed, expire_at_ns)`. Allowed when no cooldown is active.
    fn can_scale_app<'a>(&'a self, app_id: &'a str) -> StoreFuture<'a, (bool, i64)>;

    /// Replace the app's cooldown record.
    fn update_scaling_cooldown_expire_time<'a>(
        &'a self,
        app_id: &'a str,
        expire_at: i64,
    ) -> StoreFuture<'a, ()>;

    fn get_active_schedule<'a>(&'a self, app_id: &'a str)
    -> StoreFuture<'a, Option<ActiveSchedule>>;
}

/// Where a store keeps its data.
///
/// Node-local stores hold only what this node wrote, so housekeeping on
/// them must not wait for a pool-wide lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScope {
    NodeLocal,
    Shared,
}
