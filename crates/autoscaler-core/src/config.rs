//! Pipeline configuration, loaded from TOML.
//!
//! Every field has a default so a config file only needs the two
//! collaborator URLs. Durations are human strings understood by
//! [`parse_duration`].

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::shard::Shard;
use crate::sql::{Dialect, url_scheme};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub logging: LoggingConfig,
    pub pool: PoolConfig,
    pub aggregator: AggregatorConfig,
    pub evaluator: EvaluatorConfig,
    pub metrics_source: EndpointConfig,
    pub scaling_engine: EndpointConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub state: StateConfig,
    pub lock: LockConfig,
    pub pruner: PrunerConfig,
    /// Window used for a monitor task when a rule sets none.
    pub default_stat_window_secs: u64,
    /// Breach window used when a rule sets none.
    pub default_breach_duration_secs: u64,
    pub http_client_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub node_count: u32,
    pub node_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AggregatorConfig {
    pub metric_poller_count: usize,
    pub app_monitor_channel_size: usize,
    pub app_metric_channel_size: usize,
    pub aggregator_execute_interval: String,
    pub policy_poller_interval: String,
    pub save_interval: String,
    pub metric_cache_size_per_app: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluatorConfig {
    pub evaluator_count: usize,
    pub trigger_array_channel_size: usize,
    pub evaluation_manager_execute_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    pub back_off_initial_interval: String,
    pub back_off_max_interval: String,
    pub consecutive_failure_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    /// Shared SQL database holding policies, metrics, cooldowns, and
    /// schedules. The scheme selects the SQL dialect. Empty means a
    /// node-local redb file at `path`, which only a single node can use.
    pub url: String,
    pub max_connections: u32,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub enabled: bool,
    /// Connection URL; the scheme selects the SQL dialect.
    pub url: String,
    pub table: String,
    /// Lock owner id. Empty means "generate one at startup".
    pub owner: String,
    pub ttl: String,
    pub retry_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PrunerConfig {
    pub interval: String,
    pub cutoff_days: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            pool: PoolConfig::default(),
            aggregator: AggregatorConfig::default(),
            evaluator: EvaluatorConfig::default(),
            metrics_source: EndpointConfig::default(),
            scaling_engine: EndpointConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            state: StateConfig::default(),
            lock: LockConfig::default(),
            pruner: PrunerConfig::default(),
            default_stat_window_secs: 120,
            default_breach_duration_secs: 120,
            http_client_timeout: "5s".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            node_count: 1,
            node_index: 0,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            metric_poller_count: 20,
            app_monitor_channel_size: 200,
            app_metric_channel_size: 200,
            aggregator_execute_interval: "40s".to_string(),
            policy_poller_interval: "40s".to_string(),
            save_interval: "5s".to_string(),
            metric_cache_size_per_app: 100,
        }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            evaluator_count: 20,
            trigger_array_channel_size: 200,
            evaluation_manager_execute_interval: "40s".to_string(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            back_off_initial_interval: "5m".to_string(),
            back_off_max_interval: "2h".to_string(),
            consecutive_failure_count: 3,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            path: "/var/lib/autoscaler/state.redb".to_string(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            table: "eventgenerator_lock".to_string(),
            owner: String::new(),
            ttl: "15s".to_string(),
            retry_interval: "5s".to_string(),
        }
    }
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            interval: "12h".to_string(),
            cutoff_days: 30,
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.node_count == 0 {
            bail!("pool.node_count must be at least 1");
        }
        if self.pool.node_index >= self.pool.node_count {
            bail!(
                "pool.node_index {} is out of range for node_count {}",
                self.pool.node_index,
                self.pool.node_count
            );
        }

        let agg = &self.aggregator;
        if agg.metric_poller_count == 0 {
            bail!("aggregator.metric_poller_count must be positive");
        }
        if agg.app_monitor_channel_size == 0 || agg.app_metric_channel_size == 0 {
            bail!("aggregator channel sizes must be positive");
        }
        if agg.metric_cache_size_per_app == 0 {
            bail!("aggregator.metric_cache_size_per_app must be positive");
        }
        if self.evaluator.evaluator_count == 0 {
            bail!("evaluator.evaluator_count must be positive");
        }
        if self.evaluator.trigger_array_channel_size == 0 {
            bail!("evaluator.trigger_array_channel_size must be positive");
        }

        if self.metrics_source.url.trim().is_empty() {
            bail!("metrics_source.url is required");
        }
        if self.scaling_engine.url.trim().is_empty() {
            bail!("scaling_engine.url is required");
        }

        for (name, value) in [
            ("aggregator.aggregator_execute_interval", &agg.aggregator_execute_interval),
            ("aggregator.policy_poller_interval", &agg.policy_poller_interval),
            ("aggregator.save_interval", &agg.save_interval),
            (
                "evaluator.evaluation_manager_execute_interval",
                &self.evaluator.evaluation_manager_execute_interval,
            ),
            (
                "circuit_breaker.back_off_initial_interval",
                &self.circuit_breaker.back_off_initial_interval,
            ),
            (
                "circuit_breaker.back_off_max_interval",
                &self.circuit_breaker.back_off_max_interval,
            ),
            ("http_client_timeout", &self.http_client_timeout),
            ("lock.ttl", &self.lock.ttl),
            ("lock.retry_interval", &self.lock.retry_interval),
            ("pruner.interval", &self.pruner.interval),
        ] {
            match parse_duration(value) {
                Some(d) if !d.is_zero() => {}
                _ => bail!("{name}: invalid duration {value:?}"),
            }
        }

        if self.state.is_shared() {
            if Dialect::from_url(&self.state.url).is_none() {
                bail!("state.url: unsupported database {:?}", url_scheme(&self.state.url));
            }
            if self.state.max_connections == 0 {
                bail!("state.max_connections must be positive");
            }
        } else if self.pool.node_count > 1 {
            bail!(
                "state.url is required when pool.node_count is {}: a local state file cannot be shared",
                self.pool.node_count
            );
        }

        if self.lock.enabled {
            if self.lock.url.trim().is_empty() {
                bail!("lock.url is required when lock.enabled is set");
            }
            if Dialect::from_url(&self.lock.url).is_none() {
                bail!("lock.url: unsupported database {:?}", url_scheme(&self.lock.url));
            }
        }
        // The holder renews at least twice per ttl, so one missed renewal
        // does not hand the lock to another node.
        let (ttl, retry) = (self.lock.ttl(), self.lock.retry_interval());
        if retry.saturating_mul(2) > ttl {
            bail!("lock.retry_interval ({retry:?}) must be at most half of lock.ttl ({ttl:?})");
        }
        if !is_sql_identifier(&self.lock.table) {
            bail!("lock.table {:?} is not a plain SQL identifier", self.lock.table);
        }

        Ok(())
    }

    pub fn shard(&self) -> Shard {
        Shard::new(self.pool.node_count, self.pool.node_index)
    }

    pub fn default_stat_window(&self) -> Duration {
        Duration::from_secs(self.default_stat_window_secs)
    }

    pub fn default_breach_duration(&self) -> Duration {
        Duration::from_secs(self.default_breach_duration_secs)
    }

    pub fn http_client_timeout(&self) -> Duration {
        duration_or(&self.http_client_timeout, Duration::from_secs(5))
    }
}

impl AggregatorConfig {
    pub fn execute_interval(&self) -> Duration {
        duration_or(&self.aggregator_execute_interval, Duration::from_secs(40))
    }

    pub fn policy_poll_interval(&self) -> Duration {
        duration_or(&self.policy_poller_interval, Duration::from_secs(40))
    }

    pub fn save_interval(&self) -> Duration {
        duration_or(&self.save_interval, Duration::from_secs(5))
    }
}

impl EvaluatorConfig {
    pub fn execute_interval(&self) -> Duration {
        duration_or(
            &self.evaluation_manager_execute_interval,
            Duration::from_secs(40),
        )
    }
}

impl CircuitBreakerConfig {
    pub fn initial_backoff(&self) -> Duration {
        duration_or(&self.back_off_initial_interval, Duration::from_secs(300))
    }

    pub fn max_backoff(&self) -> Duration {
        duration_or(&self.back_off_max_interval, Duration::from_secs(7200))
    }
}

impl StateConfig {
    /// Whether the store is the pool-wide SQL database.
    pub fn is_shared(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        duration_or(&self.ttl, Duration::from_secs(15))
    }

    pub fn retry_interval(&self) -> Duration {
        duration_or(&self.retry_interval, Duration::from_secs(5))
    }
}

impl PrunerConfig {
    pub fn interval(&self) -> Duration {
        duration_or(&self.interval, Duration::from_secs(12 * 3600))
    }

    pub fn cutoff(&self) -> Duration {
        Duration::from_secs(self.cutoff_days.saturating_mul(24 * 3600))
    }
}

/// True for `[A-Za-z_][A-Za-z0-9_]*`: safe to splice into SQL as a table name.
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn duration_or(value: &str, fallback: Duration) -> Duration {
    parse_duration(value).unwrap_or(fallback)
}
