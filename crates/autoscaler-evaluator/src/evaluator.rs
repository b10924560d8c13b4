//! Evaluator: decides whether a batch of rules calls for a scale action.
//!
//! Rules of one app are evaluated in order against the trailing
//! `breach_duration` window of metric history. A rule fires only when the
//! window is non-empty and every sample satisfies the comparison. The
//! first rule that fires ends the batch: cooldown is consulted, the
//! effective instance bounds are resolved, and one request goes to the
//! scaling engine.

use std::sync::Arc;
use std::time::Duration;

use autoscaler_state::*;
use tracing::{debug, error, info, warn};

use crate::engine::{ScaleRequest, ScalingEngineClient};

/// All rules of one app for one evaluation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerBatch {
    pub app_id: AppId,
    pub instance_min_count: i32,
    pub instance_max_count: i32,
    pub rules: Vec<ScalingRule>,
}

impl TriggerBatch {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            app_id: policy.app_id.clone(),
            instance_min_count: policy.instance_min_count,
            instance_max_count: policy.instance_max_count,
            rules: policy.scaling_rules.clone(),
        }
    }
}

/// What one batch evaluation did.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    /// No rule fired.
    NoBreach,
    /// A rule fired but the app is cooling down until `expire_at` (ns).
    CoolingDown { metric_type: String, expire_at: i64 },
    /// The scaling engine accepted the request.
    Scaled(ScaleRequest),
    /// The request was built but the scaling engine call failed.
    ScaleFailed { request: ScaleRequest, error: String },
    /// Cooldown state could not be read; nothing was sent.
    StoreFailed(String),
}

/// Whether every sample in `window` breaches `rule`.
///
/// An empty window, an empty value, or a value that is not an integer
/// never breaches.
pub fn window_breached(rule: &ScalingRule, window: &[AppMetric]) -> bool {
    if window.is_empty() {
        return false;
    }
    window.iter().all(|metric| {
        if !metric.has_value() {
            return false;
        }
        match metric.value.trim().parse::<i64>() {
            Ok(value) => rule.operator.breached(value, rule.threshold),
            Err(_) => {
                debug!(
                    app_id = %metric.app_id,
                    metric_type = %metric.metric_type,
                    value = %metric.value,
                    "non-integer metric value in breach window"
                );
                false
            }
        }
    })
}

pub struct Evaluator {
    id: usize,
    history: Arc<dyn MetricHistory>,
    scaling: Arc<dyn ScalingStore>,
    engine: ScalingEngineClient,
    default_breach_duration: Duration,
}

impl Evaluator {
    pub fn new(
        id: usize,
        history: Arc<dyn MetricHistory>,
        scaling: Arc<dyn ScalingStore>,
        engine: ScalingEngineClient,
        default_breach_duration: Duration,
    ) -> Self {
        Self {
            id,
            history,
            scaling,
            engine,
            default_breach_duration,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub async fn evaluate(&self, batch: &TriggerBatch) -> EvaluationOutcome {
        self.evaluate_at(batch, epoch_nanos()).await
    }

    /// Evaluate `batch` with `now` (ns) as the end of every breach window.
    pub async fn evaluate_at(&self, batch: &TriggerBatch, now: i64) -> EvaluationOutcome {
        for rule in &batch.rules {
            let breach = rule.breach_duration(self.default_breach_duration);
            let span = i64::try_from(breach.as_nanos()).unwrap_or(i64::MAX);
            let start = now.saturating_sub(span);

            let window = match self
                .history
                .query_app_metrics(&batch.app_id, &rule.metric_type, start, now, OrderType::Asc)
                .await
            {
                Ok(window) => window,
                Err(e) => {
                    warn!(
                        evaluator = self.id,
                        app_id = %batch.app_id,
                        metric_type = %rule.metric_type,
                        start,
                        end = now,
                        error = %e,
                        "failed to query metric history"
                    );
                    continue;
                }
            };

            if window.is_empty() {
                debug!(
                    evaluator = self.id,
                    app_id = %batch.app_id,
                    metric_type = %rule.metric_type,
                    start,
                    end = now,
                    "no metrics in breach window"
                );
                continue;
            }
            if !window_breached(rule, &window) {
                continue;
            }

            info!(
                evaluator = self.id,
                app_id = %batch.app_id,
                metric_type = %rule.metric_type,
                operator = %rule.operator,
                threshold = rule.threshold,
                samples = window.len(),
                "scaling rule breached"
            );
            let unit = window[0].unit.clone();
            return self.fire(batch, rule, unit).await;
        }
        EvaluationOutcome::NoBreach
    }

    async fn fire(&self, batch: &TriggerBatch, rule: &ScalingRule, unit: String) -> EvaluationOutcome {
        match self.scaling.can_scale_app(&batch.app_id).await {
            Ok((true, _)) => {}
            Ok((false, expire_at)) => {
                debug!(
                    evaluator = self.id,
                    app_id = %batch.app_id,
                    expire_at,
                    "app is cooling down, scale suppressed"
                );
                return EvaluationOutcome::CoolingDown {
                    metric_type: rule.metric_type.clone(),
                    expire_at,
                };
            }
            Err(e) => {
                error!(
                    evaluator = self.id,
                    app_id = %batch.app_id,
                    error = %e,
                    "failed to read cooldown"
                );
                return EvaluationOutcome::StoreFailed(e.to_string());
            }
        }

        let request = self.build_request(batch, rule, unit).await;
        match self.engine.scale(&request).await {
            Ok(()) => {
                info!(
                    evaluator = self.id,
                    app_id = %request.app_id,
                    metric_type = %request.metric_type,
                    adjustment = %request.adjustment,
                    "scale request sent"
                );
                EvaluationOutcome::Scaled(request)
            }
            Err(e) => {
                error!(
                    evaluator = self.id,
                    app_id = %request.app_id,
                    metric_type = %request.metric_type,
                    error = %e,
                    "scale request failed"
                );
                EvaluationOutcome::ScaleFailed {
                    request,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn build_request(
        &self,
        batch: &TriggerBatch,
        rule: &ScalingRule,
        unit: String,
    ) -> ScaleRequest {
        let schedule = match self.scaling.get_active_schedule(&batch.app_id).await {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(
                    evaluator = self.id,
                    app_id = %batch.app_id,
                    error = %e,
                    "failed to read active schedule, using policy bounds"
                );
                None
            }
        };
        let (min, max, schedule_id) = match schedule {
            Some(s) => (s.instance_min_count, s.instance_max_count, Some(s.schedule_id)),
            None => (batch.instance_min_count, batch.instance_max_count, None),
        };

        ScaleRequest {
            app_id: batch.app_id.clone(),
            metric_type: rule.metric_type.clone(),
            metric_unit: unit,
            breach_duration_secs: i64::try_from(
                rule.breach_duration(self.default_breach_duration).as_secs(),
            )
            .unwrap_or(i64::MAX),
            threshold: rule.threshold,
            operator: rule.operator,
            cool_down_secs: rule.cool_down_secs,
            adjustment: rule.adjustment,
            instance_min_count: min,
            instance_max_count: max,
            schedule_id,
        }
    }
}
