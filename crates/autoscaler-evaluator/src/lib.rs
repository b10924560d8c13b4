//! autoscaler-evaluator: turns metric history into scale requests.
//!
//! # Architecture
//!
//! ```text
//!   AppManager policies ──▶ EvaluationManager loop (skips open breakers)
//!                                 │ TriggerBatch per app
//!                                 ▼
//!                          [bounded channel]
//!                                 │
//!                    Evaluator × N ◀┘
//!                      │ MetricHistory window, all-of breach check
//!                      │ ScalingStore cooldown gate, active schedule bounds
//!                      ▼
//!                ScalingEngineClient ── POST /v1/apps/{app}/scale
//! ```

pub mod breaker;
pub mod engine;
pub mod evaluator;
pub mod manager;

pub use breaker::ScaleBreaker;
pub use engine::{ScaleError, ScaleRequest, ScalingEngineClient};
pub use evaluator::{EvaluationOutcome, Evaluator, TriggerBatch};
pub use manager::{EvaluationManager, EvaluationSettings, trigger_batches};
