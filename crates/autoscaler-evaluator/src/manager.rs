//! EvaluationManager: periodic trigger fan-out to the evaluator pool.
//!
//! Every `execute_interval` the loop turns each owned policy into one
//! [`TriggerBatch`] and pushes it onto a bounded channel. A full channel
//! blocks the loop, so slow evaluators throttle the fan-out. Apps whose
//! circuit breaker is open are skipped until the backoff elapses.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use autoscaler_aggregator::AppManager;
use autoscaler_core::PipelineConfig;
use autoscaler_core::config::CircuitBreakerConfig;
use autoscaler_state::{AppId, Policy, ScalingStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::breaker::ScaleBreaker;
use crate::engine::ScalingEngineClient;
use crate::evaluator::{EvaluationOutcome, Evaluator, TriggerBatch};

#[derive(Debug, Clone)]
pub struct EvaluationSettings {
    pub evaluator_count: usize,
    pub trigger_channel_size: usize,
    pub execute_interval: Duration,
    pub default_breach_duration: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl EvaluationSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            evaluator_count: config.evaluator.evaluator_count,
            trigger_channel_size: config.evaluator.trigger_array_channel_size,
            execute_interval: config.evaluator.execute_interval(),
            default_breach_duration: config.default_breach_duration(),
            breaker: config.circuit_breaker.clone(),
        }
    }
}

/// One batch per app with at least one rule, in app order.
pub fn trigger_batches(policies: &HashMap<AppId, Policy>) -> Vec<TriggerBatch> {
    let sorted: BTreeMap<_, _> = policies.iter().collect();
    sorted
        .into_values()
        .filter(|policy| !policy.scaling_rules.is_empty())
        .map(TriggerBatch::from_policy)
        .collect()
}

/// Per-app breakers, created on first use from one template.
struct Breakers {
    template: ScaleBreaker,
    by_app: Mutex<HashMap<AppId, ScaleBreaker>>,
}

impl Breakers {
    fn is_open(&self, app_id: &str, now: Instant) -> bool {
        self.by_app
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_id)
            .is_some_and(|b| b.is_open(now))
    }

    fn record(&self, app_id: &str, outcome: &EvaluationOutcome) {
        let mut by_app = self.by_app.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            EvaluationOutcome::Scaled(_) => {
                if let Some(b) = by_app.get_mut(app_id) {
                    b.record_success();
                }
            }
            EvaluationOutcome::ScaleFailed { .. } => {
                by_app
                    .entry(app_id.to_string())
                    .or_insert_with(|| self.template.clone())
                    .record_failure(Instant::now());
            }
            _ => {}
        }
    }

    fn retain(&self, owned: &HashMap<AppId, Policy>) {
        self.by_app
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|app_id, _| owned.contains_key(app_id));
    }
}

type BatchReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<TriggerBatch>>>;

/// Running evaluation manager: its loop and its evaluator pool.
pub struct EvaluationManager {
    evaluators: Vec<JoinHandle<()>>,
    evaluator_shutdown: watch::Sender<bool>,
    ticker: JoinHandle<()>,
    done: watch::Sender<bool>,
    breakers: Arc<Breakers>,
}

impl EvaluationManager {
    /// Spawn the evaluator pool and the trigger loop.
    ///
    /// `app_manager` supplies both the owned policies and the cache-first
    /// metric history.
    pub fn start(
        settings: EvaluationSettings,
        app_manager: Arc<AppManager>,
        scaling: Arc<dyn ScalingStore>,
        engine: ScalingEngineClient,
    ) -> Self {
        let (batch_tx, batch_rx) = mpsc::channel(settings.trigger_channel_size.max(1));
        let (evaluator_shutdown, evaluator_shutdown_rx) = watch::channel(false);
        let (done, done_rx) = watch::channel(false);
        let breakers = Arc::new(Breakers {
            template: ScaleBreaker::from_config(&settings.breaker),
            by_app: Mutex::new(HashMap::new()),
        });

        let batch_rx: BatchReceiver = Arc::new(tokio::sync::Mutex::new(batch_rx));
        let evaluators = (0..settings.evaluator_count.max(1))
            .map(|id| {
                let evaluator = Evaluator::new(
                    id,
                    app_manager.clone(),
                    scaling.clone(),
                    engine.clone(),
                    settings.default_breach_duration,
                );
                tokio::spawn(run_evaluator(
                    evaluator,
                    batch_rx.clone(),
                    breakers.clone(),
                    evaluator_shutdown_rx.clone(),
                ))
            })
            .collect();

        let ticker = tokio::spawn(trigger_loop(
            app_manager,
            batch_tx,
            breakers.clone(),
            settings.execute_interval,
            done_rx,
        ));

        info!(
            evaluators = settings.evaluator_count,
            execute_secs = settings.execute_interval.as_secs(),
            "evaluation manager started"
        );

        Self {
            evaluators,
            evaluator_shutdown,
            ticker,
            done,
            breakers,
        }
    }

    pub fn breaker_open(&self, app_id: &str) -> bool {
        self.breakers.is_open(app_id, Instant::now())
    }

    /// Stop evaluators, then the trigger loop.
    pub async fn stop(self) {
        let _ = self.evaluator_shutdown.send(true);
        for handle in self.evaluators {
            if let Err(e) = handle.await {
                error!(error = %e, "evaluator panicked");
            }
        }
        debug!("evaluators stopped");

        let _ = self.done.send(true);
        if let Err(e) = self.ticker.await {
            error!(error = %e, "evaluation loop panicked");
        }
        info!("evaluation manager stopped");
    }
}

async fn trigger_loop(
    app_manager: Arc<AppManager>,
    batches: mpsc::Sender<TriggerBatch>,
    breakers: Arc<Breakers>,
    interval: Duration,
    mut done: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = done.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let policies = app_manager.policies();
        breakers.retain(&policies);

        let now = Instant::now();
        let mut sent = 0usize;
        for batch in trigger_batches(&policies) {
            if breakers.is_open(&batch.app_id, now) {
                debug!(app_id = %batch.app_id, "scale breaker open, skipping app");
                continue;
            }
            tokio::select! {
                biased;
                _ = done.changed() => {
                    debug!("evaluation loop stopping mid-cycle");
                    return;
                }
                result = batches.send(batch) => {
                    if result.is_err() {
                        warn!("trigger channel closed");
                        return;
                    }
                    sent += 1;
                }
            }
        }
        debug!(batches = sent, "trigger batches dispatched");
    }
    debug!("evaluation loop stopped");
}

async fn run_evaluator(
    evaluator: Evaluator,
    batches: BatchReceiver,
    breakers: Arc<Breakers>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(evaluator = evaluator.id(), "evaluator started");
    loop {
        let batch = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            batch = next_batch(&batches) => batch,
        };
        let Some(batch) = batch else { break };
        // The breaker may have opened while this batch was queued.
        if breakers.is_open(&batch.app_id, Instant::now()) {
            continue;
        }
        let outcome = evaluator.evaluate(&batch).await;
        breakers.record(&batch.app_id, &outcome);
    }
    debug!(evaluator = evaluator.id(), "evaluator stopped");
}

async fn next_batch(batches: &BatchReceiver) -> Option<TriggerBatch> {
    batches.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use autoscaler_core::{HttpClient, Shard};
    use autoscaler_state::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;

    const BREACHING: &str = r#"{"instance_min_count":1,"instance_max_count":5,"scaling_rules":[
        {"metric_type":"mem","breach_duration_secs":300,"threshold":30,"operator":"<","adjustment":"-1"}]}"#;
    const NO_RULES: &str = r#"{"instance_min_count":1,"instance_max_count":5}"#;

    fn policy(app_id: &str, json: &str) -> (String, Policy) {
        (app_id.to_string(), Policy::parse(app_id, json).unwrap())
    }

    #[test]
    fn batches_skip_apps_without_rules() {
        let policies: HashMap<_, _> = [
            policy("b", BREACHING),
            policy("a", BREACHING),
            policy("c", NO_RULES),
        ]
        .into_iter()
        .collect();
        let batches = trigger_batches(&policies);
        let apps: Vec<_> = batches.iter().map(|b| b.app_id.as_str()).collect();
        assert_eq!(apps, ["a", "b"]);
        assert_eq!(batches[0].rules.len(), 1);
        assert_eq!(batches[0].instance_max_count, 5);
    }

    #[test]
    fn breaker_opens_on_failures_and_closes_on_success() {
        let breakers = Breakers {
            template: ScaleBreaker::new(2, Duration::from_secs(60), Duration::from_secs(60)),
            by_app: Mutex::new(HashMap::new()),
        };
        let failed = EvaluationOutcome::ScaleFailed {
            request: crate::engine::ScaleRequest {
                app_id: "a1".to_string(),
                metric_type: "mem".to_string(),
                metric_unit: String::new(),
                breach_duration_secs: 300,
                threshold: 30,
                operator: Operator::Less,
                cool_down_secs: 0,
                adjustment: Adjustment::Delta(-1),
                instance_min_count: 1,
                instance_max_count: 5,
                schedule_id: None,
            },
            error: "boom".to_string(),
        };

        breakers.record("a1", &failed);
        assert!(!breakers.is_open("a1", Instant::now()));
        breakers.record("a1", &EvaluationOutcome::NoBreach);
        breakers.record("a1", &failed);
        assert!(breakers.is_open("a1", Instant::now()));
        assert!(!breakers.is_open("a2", Instant::now()));

        let EvaluationOutcome::ScaleFailed { request, .. } = failed else {
            unreachable!()
        };
        breakers.record("a1", &EvaluationOutcome::Scaled(request));
        assert!(!breakers.is_open("a1", Instant::now()));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn failing_engine_trips_the_breaker() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = {
            let hits = hits.clone();
            Router::new().route(
                "/v1/apps/{app}/scale",
                post(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }),
            )
        };
        let base = serve(router).await;

        let store = StateStore::open_in_memory().unwrap();
        store
            .put_policy(&PolicyJson {
                app_id: "a1".to_string(),
                policy_json: BREACHING.to_string(),
                guid: "g1".to_string(),
            })
            .unwrap();
        let now = epoch_nanos();
        store
            .save_app_metrics_in_bulk(&[AppMetric {
                app_id: "a1".to_string(),
                metric_type: "mem".to_string(),
                value: "20".to_string(),
                unit: "MB".to_string(),
                timestamp: now - 10_000_000_000,
            }])
            .unwrap();
        let app_manager = Arc::new(AppManager::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Shard::single(),
            10,
            Duration::from_secs(40),
        ));
        app_manager.refresh().await.unwrap();

        let manager = EvaluationManager::start(
            EvaluationSettings {
                evaluator_count: 1,
                trigger_channel_size: 1,
                execute_interval: Duration::from_millis(30),
                default_breach_duration: Duration::from_secs(120),
                breaker: CircuitBreakerConfig {
                    back_off_initial_interval: "1h".to_string(),
                    back_off_max_interval: "2h".to_string(),
                    consecutive_failure_count: 1,
                },
            },
            app_manager,
            Arc::new(store),
            ScalingEngineClient::new(&base, HttpClient::new(Duration::from_secs(2))),
        );

        for _ in 0..100 {
            if manager.breaker_open("a1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(manager.breaker_open("a1"));
        let after_open = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), after_open);

        tokio::time::timeout(Duration::from_secs(2), manager.stop())
            .await
            .unwrap();
    }
}
