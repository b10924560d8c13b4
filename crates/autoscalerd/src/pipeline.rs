//! Pipeline assembly and ordered shutdown.

use std::path::Path;
use std::sync::Arc;

use autoscaler_aggregator::{Aggregator, AggregatorSettings, AppManager, MetricsSourceClient};
use autoscaler_core::config::StateConfig;
use autoscaler_core::{HttpClient, PipelineConfig};
use autoscaler_evaluator::{EvaluationManager, EvaluationSettings, ScalingEngineClient};
use autoscaler_lock::{Dialect, LockMaintainer, SqlLock};
use autoscaler_state::{MetricStore, PolicyStore, ScalingStore, SqlStore, StateStore, StoreScope};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::pruner::{MetricPruner, prune_gate};

/// A background loop with its own shutdown signal.
struct Background {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Background {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(task = self.name, error = %e, "background task panicked");
        }
    }
}

/// The store contracts the loops share, backed by one store.
struct Stores {
    policies: Arc<dyn PolicyStore>,
    metrics: Arc<dyn MetricStore>,
    scaling: Arc<dyn ScalingStore>,
    scope: StoreScope,
}

impl Stores {
    fn backed_by<S>(store: S, scope: StoreScope) -> Self
    where
        S: PolicyStore + MetricStore + ScalingStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            policies: store.clone(),
            metrics: store.clone(),
            scaling: store,
            scope,
        }
    }

    /// The shared SQL store when `state.url` is set, else the local redb file.
    async fn open(config: &StateConfig) -> anyhow::Result<Self> {
        if config.is_shared() {
            let store = SqlStore::connect(&config.url, config.max_connections).await?;
            if store.dialect() == Dialect::Sqlite {
                store.ensure_schema().await?;
            }
            info!(dialect = ?store.dialect(), "shared state store connected");
            return Ok(Self::backed_by(store, StoreScope::Shared));
        }
        let path = Path::new(&config.path);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let store = StateStore::open(path)?;
        info!(path = %path.display(), "node-local state store opened");
        Ok(Self::backed_by(store, StoreScope::NodeLocal))
    }
}

pub struct Pipeline {
    aggregator: Aggregator,
    evaluation: EvaluationManager,
    app_manager: Background,
    lock: Option<Background>,
    pruner: Background,
}

impl Pipeline {
    pub async fn start(config: &PipelineConfig) -> anyhow::Result<Self> {
        let stores = Stores::open(&config.state).await?;

        // ── Distributed lock ───────────────────────────────────────
        // Connected before any loop starts.
        let (lock, held) = if config.lock.enabled {
            let sql_lock = SqlLock::connect(&config.lock.url, &config.lock.table).await?;
            if sql_lock.dialect() == Dialect::Sqlite {
                sql_lock.ensure_table().await?;
            }
            let owner = if config.lock.owner.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                config.lock.owner.clone()
            };
            let maintainer = Arc::new(LockMaintainer::new(
                Arc::new(sql_lock),
                owner,
                config.lock.ttl(),
                config.lock.retry_interval(),
            ));
            info!(owner = %maintainer.owner(), table = %config.lock.table, "distributed lock enabled");
            let held = maintainer.subscribe();
            let (shutdown, rx) = watch::channel(false);
            let task = Background {
                name: "lock-maintainer",
                shutdown,
                handle: tokio::spawn(async move { maintainer.run(rx).await }),
            };
            (Some(task), Some(held))
        } else {
            (None, None)
        };

        let http = HttpClient::new(config.http_client_timeout());

        // ── AppManager ─────────────────────────────────────────────
        let app_manager = Arc::new(AppManager::new(
            stores.policies.clone(),
            stores.metrics.clone(),
            config.shard(),
            config.aggregator.metric_cache_size_per_app,
            config.aggregator.policy_poll_interval(),
        ));
        let app_manager_task = {
            let (shutdown, rx) = watch::channel(false);
            let app_manager = app_manager.clone();
            Background {
                name: "app-manager",
                shutdown,
                handle: tokio::spawn(async move { app_manager.run(rx).await }),
            }
        };

        // ── Aggregator ─────────────────────────────────────────────
        let aggregator = Aggregator::start(
            AggregatorSettings::from_config(config),
            app_manager.clone(),
            MetricsSourceClient::new(&config.metrics_source.url, http.clone()),
            stores.metrics.clone(),
        );

        // ── Evaluation ─────────────────────────────────────────────
        let evaluation = EvaluationManager::start(
            EvaluationSettings::from_config(config),
            app_manager,
            stores.scaling.clone(),
            ScalingEngineClient::new(&config.scaling_engine.url, http),
        );

        // ── Pruner ─────────────────────────────────────────────────
        let pruner = {
            let pruner = MetricPruner::new(
                stores.metrics.clone(),
                config.pruner.interval(),
                config.pruner.cutoff(),
                prune_gate(stores.scope, held),
            );
            let (shutdown, rx) = watch::channel(false);
            Background {
                name: "metric-pruner",
                shutdown,
                handle: tokio::spawn(async move { pruner.run(rx).await }),
            }
        };

        info!(
            node_index = config.pool.node_index,
            node_count = config.pool.node_count,
            "pipeline started"
        );
        Ok(Self {
            aggregator,
            evaluation,
            app_manager: app_manager_task,
            lock,
            pruner,
        })
    }

    /// Stop producers before their consumers, then release the lock.
    pub async fn stop(self) {
        self.aggregator.stop().await;
        self.evaluation.stop().await;
        self.app_manager.stop().await;
        if let Some(lock) = self.lock {
            lock.stop().await;
        }
        self.pruner.stop().await;
        info!("pipeline stopped");
    }
}
