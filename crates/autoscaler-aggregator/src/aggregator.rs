//! Aggregator: monitor task fan-out and batched metric persistence.
//!
//! Two loops share one shutdown signal:
//!
//! - dispatch: every `execute_interval`, one [`MonitorTask`] per owned
//!   (app, metric type) pair goes onto a bounded channel. A full channel
//!   blocks the loop, so slow pollers throttle dispatch.
//! - flush: every aggregated metric is cached and appended to a batch;
//!   every `save_interval` the batch is written to the metric store in the
//!   background. A failed write drops the batch.
//!
//! Pollers are stopped before the loops so no task is handed to a worker
//! that is gone.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use autoscaler_core::PipelineConfig;
use autoscaler_state::{AppMetric, MetricStore, Policy};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::app_manager::AppManager;
use crate::fetcher::MetricsSourceClient;
use crate::poller::{MetricPoller, MonitorTask};

/// Tunables for the aggregator and its poller pool.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub poller_count: usize,
    pub task_channel_size: usize,
    pub metric_channel_size: usize,
    pub execute_interval: Duration,
    pub save_interval: Duration,
    pub default_stat_window: Duration,
}

impl AggregatorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let agg = &config.aggregator;
        Self {
            poller_count: agg.metric_poller_count,
            task_channel_size: agg.app_monitor_channel_size,
            metric_channel_size: agg.app_metric_channel_size,
            execute_interval: agg.execute_interval(),
            save_interval: agg.save_interval(),
            default_stat_window: config.default_stat_window(),
        }
    }
}

/// One task per distinct (app, metric type), in app order.
///
/// The first rule naming a metric type decides its stat window.
pub fn monitor_tasks(
    policies: &HashMap<String, Policy>,
    default_stat_window: Duration,
) -> Vec<MonitorTask> {
    let sorted: BTreeMap<_, _> = policies.iter().collect();
    let mut tasks = Vec::new();
    for (app_id, policy) in sorted {
        let mut seen: Vec<&str> = Vec::new();
        for rule in &policy.scaling_rules {
            if seen.contains(&rule.metric_type.as_str()) {
                continue;
            }
            seen.push(&rule.metric_type);
            tasks.push(MonitorTask {
                app_id: app_id.clone(),
                metric_type: rule.metric_type.clone(),
                stat_window: rule.stat_window(default_stat_window),
            });
        }
    }
    tasks
}

/// Running aggregator: its loops and its poller pool.
pub struct Aggregator {
    pollers: Vec<JoinHandle<()>>,
    poller_shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    done: watch::Sender<bool>,
}

impl Aggregator {
    /// Spawn the poller pool and both loops.
    pub fn start(
        settings: AggregatorSettings,
        app_manager: Arc<AppManager>,
        source: MetricsSourceClient,
        metric_store: Arc<dyn MetricStore>,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel(settings.task_channel_size.max(1));
        let (metric_tx, metric_rx) = mpsc::channel(settings.metric_channel_size.max(1));
        let (poller_shutdown, poller_shutdown_rx) = watch::channel(false);
        let (done, done_rx) = watch::channel(false);

        let task_rx = Arc::new(Mutex::new(task_rx));
        let pollers = (0..settings.poller_count.max(1))
            .map(|id| {
                let poller = MetricPoller::new(id, source.clone(), task_rx.clone(), metric_tx.clone());
                let shutdown = poller_shutdown_rx.clone();
                tokio::spawn(async move { poller.run(shutdown).await })
            })
            .collect();
        drop(metric_tx);

        let dispatch = {
            let app_manager = app_manager.clone();
            let done = done_rx.clone();
            let settings = settings.clone();
            tokio::spawn(async move { dispatch_loop(app_manager, task_tx, settings, done).await })
        };
        let flush = tokio::spawn(flush_loop(
            metric_rx,
            app_manager,
            metric_store,
            settings.save_interval,
            done_rx,
        ));

        info!(
            pollers = settings.poller_count,
            execute_secs = settings.execute_interval.as_secs(),
            save_ms = settings.save_interval.as_millis() as u64,
            "aggregator started"
        );

        Self {
            pollers,
            poller_shutdown,
            loops: vec![dispatch, flush],
            done,
        }
    }

    /// Stop pollers, then both loops.
    pub async fn stop(self) {
        let _ = self.poller_shutdown.send(true);
        for handle in self.pollers {
            if let Err(e) = handle.await {
                error!(error = %e, "metric poller panicked");
            }
        }
        debug!("metric pollers stopped");

        let _ = self.done.send(true);
        for handle in self.loops {
            if let Err(e) = handle.await {
                error!(error = %e, "aggregator loop panicked");
            }
        }
        info!("aggregator stopped");
    }
}

async fn dispatch_loop(
    app_manager: Arc<AppManager>,
    tasks: mpsc::Sender<MonitorTask>,
    settings: AggregatorSettings,
    mut done: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = done.changed() => break,
            _ = tokio::time::sleep(settings.execute_interval) => {}
        }

        let batch = monitor_tasks(&app_manager.policies(), settings.default_stat_window);
        let count = batch.len();
        for task in batch {
            tokio::select! {
                biased;
                _ = done.changed() => {
                    debug!("dispatch loop stopping mid-cycle");
                    return;
                }
                sent = tasks.send(task) => {
                    if sent.is_err() {
                        warn!("monitor task channel closed");
                        return;
                    }
                }
            }
        }
        debug!(tasks = count, "monitor tasks dispatched");
    }
    debug!("dispatch loop stopped");
}

async fn flush_loop(
    mut metrics: mpsc::Receiver<AppMetric>,
    app_manager: Arc<AppManager>,
    store: Arc<dyn MetricStore>,
    save_interval: Duration,
    mut done: watch::Receiver<bool>,
) {
    let mut batch: Vec<AppMetric> = Vec::new();
    let mut ticker = tokio::time::interval(save_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = done.changed() => break,
            Some(metric) = metrics.recv() => {
                app_manager.save_metric_to_cache(&metric);
                batch.push(metric);
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    tokio::spawn(save_batch(store.clone(), std::mem::take(&mut batch)));
                }
            }
        }
    }

    // Pollers are gone by now; keep whatever they already published.
    while let Ok(metric) = metrics.try_recv() {
        app_manager.save_metric_to_cache(&metric);
        batch.push(metric);
    }
    if !batch.is_empty() {
        save_batch(store, batch).await;
    }
    debug!("flush loop stopped");
}

async fn save_batch(store: Arc<dyn MetricStore>, batch: Vec<AppMetric>) {
    let count = batch.len();
    match store.save_app_metrics_in_bulk(&batch).await {
        Ok(()) => debug!(count, "app metrics saved"),
        Err(e) => error!(count, error = %e, "failed to save app metrics, batch dropped"),
    }
}
