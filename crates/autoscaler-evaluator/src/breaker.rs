//! Per-app circuit breaker for scale requests.

use std::time::{Duration, Instant};

use autoscaler_core::config::CircuitBreakerConfig;
use tracing::{debug, warn};

/// Tracks consecutive scale-request failures for one app.
///
/// After `failure_threshold` failures in a row the breaker opens for the
/// current backoff. Every further failure re-opens it with the backoff
/// doubled, up to `max_backoff`. One success closes it.
#[derive(Debug, Clone)]
pub struct ScaleBreaker {
    consecutive_failures: u32,
    failure_threshold: u32,
    current_backoff: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    /// When the breaker last opened, and for how long.
    opened: Option<(Instant, Duration)>,
}

impl ScaleBreaker {
    pub fn new(failure_threshold: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            current_backoff: initial_backoff,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            opened: None,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(
            config.consecutive_failure_count,
            config.initial_backoff(),
            config.max_backoff(),
        )
    }

    pub fn record_success(&mut self) {
        if self.opened.is_some() || self.consecutive_failures > 0 {
            debug!(
                failures = self.consecutive_failures,
                "scale breaker closed"
            );
        }
        self.consecutive_failures = 0;
        self.current_backoff = self.initial_backoff;
        self.opened = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < self.failure_threshold {
            return;
        }

        self.opened = Some((now, self.current_backoff));
        warn!(
            failures = self.consecutive_failures,
            backoff_secs = self.current_backoff.as_secs(),
            "scale breaker opened"
        );
        self.current_backoff = self.current_backoff.saturating_mul(2).min(self.max_backoff);
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.opened
            .is_some_and(|(at, backoff)| now.saturating_duration_since(at) < backoff)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Backoff applied on the next opening.
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
