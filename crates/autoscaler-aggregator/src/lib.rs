//! autoscaler-aggregator: turns policies into aggregated app metrics.
//!
//! # Architecture
//!
//! ```text
//!   PolicyStore ──▶ AppManager (shard filter, per-app MetricCache)
//!                        │ owned policies
//!                        ▼
//!   Aggregator dispatch loop ──MonitorTask──▶ [bounded channel]
//!                                                  │
//!                         MetricPoller × N ◀───────┘
//!                           │ GET metrics source, ceil(mean)
//!                           ▼
//!   Aggregator flush loop ──▶ AppManager cache + batched MetricStore insert
//! ```

pub mod aggregator;
pub mod app_manager;
pub mod cache;
pub mod fetcher;
pub mod poller;

pub use aggregator::{Aggregator, AggregatorSettings, monitor_tasks};
pub use app_manager::AppManager;
pub use cache::MetricCache;
pub use fetcher::{FetchError, MetricsSourceClient};
pub use poller::{MetricPoller, MonitorTask, aggregate};
