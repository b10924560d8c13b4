//! autoscaler-core: shared building blocks for the signal pipeline.
//!
//! - [`PipelineConfig`]: TOML configuration with defaults and validation
//! - [`parse_duration`]: human duration strings (`"500ms"`, `"40s"`, `"5m"`, `"2h"`)
//! - [`Shard`]: stable FNV-1a ownership of apps across pipeline nodes
//! - [`HttpClient`]: timeout-bounded HTTP/1 client used for the metrics
//!   source and the scaling engine
//! - [`Dialect`]: SQL flavour of the shared store and lock databases

pub mod config;
pub mod duration;
pub mod http;
pub mod shard;
pub mod sql;

pub use config::PipelineConfig;
pub use duration::parse_duration;
pub use http::{HttpClient, HttpError, HttpResponse};
pub use shard::{Shard, fnv32a};
pub use sql::Dialect;
