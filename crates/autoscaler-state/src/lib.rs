//! autoscaler-state: domain types and persistence for the signal pipeline.
//!
//! Two backends implement the store contracts:
//!
//! - [`SqlStore`]: the SQL database shared by a pool of nodes, where
//!   other services write policies, cooldowns, and active schedules
//! - [`StateStore`]: an embedded [redb](https://docs.rs/redb) file for a
//!   single node, with records JSON-serialized into `&[u8]` columns
//!
//! # Architecture
//!
//! ```text
//!   PolicyStore ──────────┐     ┌─▶ SqlStore (AnyPool)      shared
//!   MetricStore ──────────┼─────┤
//!   ScalingStore ─────────┘     └─▶ StateStore (redb)       node-local
//!   MetricHistory ◀── implemented by the AppManager cache, falls
//!                     through to MetricStore on a miss
//! ```
//!
//! The pipeline only sees the contracts in [`contracts`], so tests can
//! swap in fakes and the daemon can swap in another backend.

pub mod contracts;
pub mod error;
pub mod sql;
pub mod store;
pub mod tables;
pub mod types;

pub use contracts::{
    MetricHistory, MetricStore, PolicyStore, ScalingStore, StoreFuture, StoreScope,
};
pub use error::{StateError, StateResult};
pub use sql::SqlStore;
pub use store::StateStore;
pub use types::*;
