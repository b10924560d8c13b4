//! autoscaler-lock: at-most-one-owner mutual exclusion across pipeline nodes.
//!
//! A single row in a SQL table names the current owner. Acquisition,
//! renewal, and forced takeover all happen inside one transaction that
//! reads the row before writing it, and expiry is judged by the database
//! server's clock so node clock skew cannot hand the lock to two owners.
//!
//! ```text
//!   LockMaintainer ──every retry_interval──▶ SqlLock::lock(owner, ttl)
//!        │                                        │
//!        └── watch<bool> "held" ──▶ singleton jobs (pruner, ...)
//! ```

pub mod error;
pub mod lock;
pub mod maintainer;

pub use autoscaler_core::Dialect;
pub use error::{LockError, LockResult};
pub use lock::{DistributedLock, LockFuture, SqlLock};
pub use maintainer::LockMaintainer;
