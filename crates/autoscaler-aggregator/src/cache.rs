//! Bounded, time-ordered buffer of recent app metrics.

use std::collections::VecDeque;

use autoscaler_state::{AppMetric, epoch_nanos};

/// Recent [`AppMetric`]s for one app, oldest first.
///
/// Once full, every insert evicts the oldest sample and samples older than
/// the oldest retained one are dropped. A query is only answered when the
/// cache can vouch for the whole window.
#[derive(Debug)]
pub struct MetricCache {
    capacity: usize,
    samples: VecDeque<AppMetric>,
    created_at: i64,
    evicted: bool,
}

impl MetricCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_created_at(capacity, epoch_nanos())
    }

    /// Cache that only vouches for data from `created_at` onwards.
    pub fn with_created_at(capacity: usize, created_at: i64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            created_at,
            evicted: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Insert in timestamp order, after equal timestamps. Returns false if
    /// the sample was dropped for being older than a full cache.
    pub fn put(&mut self, metric: AppMetric) -> bool {
        if self.samples.len() >= self.capacity {
            let oldest = self.samples.front().map_or(i64::MIN, |m| m.timestamp);
            if metric.timestamp < oldest {
                return false;
            }
            self.samples.pop_front();
            self.evicted = true;
        }
        let idx = self
            .samples
            .partition_point(|m| m.timestamp <= metric.timestamp);
        self.samples.insert(idx, metric);
        true
    }

    /// Samples of `metric_type` with `start <= timestamp < end`, oldest first.
    ///
    /// `None` means the cache cannot attest the window is complete and the
    /// caller must ask the durable store.
    pub fn query(&self, start: i64, end: i64, metric_type: &str) -> Option<Vec<AppMetric>> {
        if start < self.created_at {
            return None;
        }
        if self.evicted {
            let oldest = self.samples.front()?.timestamp;
            if start <= oldest {
                return None;
            }
        }
        Some(
            self.samples
                .iter()
                .filter(|m| m.timestamp >= start && m.timestamp < end && m.metric_type == metric_type)
                .cloned()
                .collect(),
        )
    }
}
