//! MetricPoller: turns one monitor task into one aggregated app metric.

use std::sync::Arc;
use std::time::Duration;

use autoscaler_state::{AppId, AppMetric, InstanceMetric, epoch_nanos};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, warn};

use crate::fetcher::MetricsSourceClient;

/// Collection work for one app and metric type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTask {
    pub app_id: AppId,
    pub metric_type: String,
    pub stat_window: Duration,
}

/// Shared end of the monitor task channel; pollers take turns receiving.
pub type TaskReceiver = Arc<Mutex<mpsc::Receiver<MonitorTask>>>;

/// Average `samples` into one metric stamped with `now`.
///
/// Values that are not integers are skipped. With nothing to average the
/// metric carries an empty value and unit.
pub fn aggregate(app_id: &str, metric_type: &str, samples: &[InstanceMetric], now: i64) -> AppMetric {
    let mut sum: i64 = 0;
    let mut count: i64 = 0;
    let mut unit = "";
    for sample in samples {
        match sample.value.trim().parse::<i64>() {
            Ok(v) => {
                sum = sum.saturating_add(v);
                count += 1;
                unit = sample.unit.as_str();
            }
            Err(e) => {
                warn!(
                    %app_id,
                    %metric_type,
                    instance_index = sample.instance_index,
                    value = %sample.value,
                    error = %e,
                    "skipping non-integer instance metric"
                );
            }
        }
    }

    let (value, unit) = if count == 0 {
        (String::new(), String::new())
    } else {
        let mean = (sum as f64 / count as f64).ceil() as i64;
        (mean.to_string(), unit.to_string())
    };

    AppMetric {
        app_id: app_id.to_string(),
        metric_type: metric_type.to_string(),
        value,
        unit,
        timestamp: now,
    }
}

/// One worker of the poller pool.
pub struct MetricPoller {
    id: usize,
    source: MetricsSourceClient,
    tasks: TaskReceiver,
    metrics: mpsc::Sender<AppMetric>,
}

impl MetricPoller {
    pub fn new(
        id: usize,
        source: MetricsSourceClient,
        tasks: TaskReceiver,
        metrics: mpsc::Sender<AppMetric>,
    ) -> Self {
        Self {
            id,
            source,
            tasks,
            metrics,
        }
    }

    /// Consume tasks until shutdown or until the task channel closes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!(poller = self.id, "metric poller started");
        loop {
            let task = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                task = next_task(&self.tasks) => task,
            };
            let Some(task) = task else { break };
            if let Some(metric) = self.poll(&task).await {
                if self.metrics.send(metric).await.is_err() {
                    debug!(poller = self.id, "metric channel closed");
                    break;
                }
            }
        }
        debug!(poller = self.id, "metric poller stopped");
    }

    /// Fetch and aggregate one task. `None` when the fetch failed.
    pub async fn poll(&self, task: &MonitorTask) -> Option<AppMetric> {
        let end = epoch_nanos();
        let window = i64::try_from(task.stat_window.as_nanos()).unwrap_or(i64::MAX);
        let start = end.saturating_sub(window);

        match self
            .source
            .instance_metrics(&task.app_id, &task.metric_type, start, end)
            .await
        {
            Ok(samples) => {
                let metric = aggregate(&task.app_id, &task.metric_type, &samples, epoch_nanos());
                debug!(
                    poller = self.id,
                    app_id = %task.app_id,
                    metric_type = %task.metric_type,
                    samples = samples.len(),
                    value = %metric.value,
                    "metric aggregated"
                );
                Some(metric)
            }
            Err(e) => {
                warn!(
                    poller = self.id,
                    app_id = %task.app_id,
                    metric_type = %task.metric_type,
                    start,
                    end,
                    error = %e,
                    "failed to fetch instance metrics"
                );
                None
            }
        }
    }
}

async fn next_task(tasks: &TaskReceiver) -> Option<MonitorTask> {
    tasks.lock().await.recv().await
}
