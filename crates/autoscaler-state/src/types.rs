//! Domain types for the signal pipeline.
//!
//! Policies arrive as JSON documents from the policy store and are parsed
//! into [`Policy`] once per refresh. Metrics, cooldowns, and schedules are
//! serialized to JSON for storage in redb tables.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Unique identifier of a scaled application.
pub type AppId = String;

// ── Policy ─────────────────────────────────────────────────────────

/// A raw policy row as returned by the policy store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyJson {
    pub app_id: AppId,
    pub policy_json: String,
    pub guid: String,
}

impl PolicyJson {
    /// Parse and validate the embedded policy document.
    pub fn parse(&self) -> StateResult<Policy> {
        Policy::parse(&self.app_id, &self.policy_json)
    }
}

/// A tenant's scaling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    /// Filled in from the owning row, not from the document.
    #[serde(skip)]
    pub app_id: AppId,
    pub instance_min_count: i32,
    pub instance_max_count: i32,
    #[serde(default)]
    pub scaling_rules: Vec<ScalingRule>,
}

impl Policy {
    pub fn parse(app_id: &str, json: &str) -> StateResult<Self> {
        let invalid = |reason: String| StateError::InvalidPolicy {
            app_id: app_id.to_string(),
            reason,
        };
        let mut policy: Policy = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        policy.app_id = app_id.to_string();

        if policy.instance_min_count < 0 {
            return Err(invalid("instance_min_count is negative".to_string()));
        }
        if policy.instance_min_count > policy.instance_max_count {
            return Err(invalid(format!(
                "instance_min_count {} exceeds instance_max_count {}",
                policy.instance_min_count, policy.instance_max_count
            )));
        }
        if let Some(rule) = policy.scaling_rules.iter().find(|r| r.metric_type.is_empty()) {
            return Err(invalid(format!(
                "scaling rule with operator {} has no metric_type",
                rule.operator
            )));
        }
        Ok(policy)
    }
}

/// One threshold condition of a policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingRule {
    pub metric_type: String,
    /// Trailing window every sample must breach. `<= 0` means the default.
    #[serde(default)]
    pub breach_duration_secs: i64,
    pub threshold: i64,
    pub operator: Operator,
    #[serde(default)]
    pub cool_down_secs: i64,
    pub adjustment: Adjustment,
    /// Collection window for the monitor task. `<= 0` or absent means the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_window_secs: Option<i64>,
}

impl ScalingRule {
    pub fn breach_duration(&self, default: Duration) -> Duration {
        positive_secs(Some(self.breach_duration_secs)).unwrap_or(default)
    }

    pub fn stat_window(&self, default: Duration) -> Duration {
        positive_secs(self.stat_window_secs).unwrap_or(default)
    }
}

fn positive_secs(secs: Option<i64>) -> Option<Duration> {
    match secs {
        Some(s) if s > 0 => Some(Duration::from_secs(s as u64)),
        _ => None,
    }
}

/// Comparison applied between a sample and a rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
        }
    }

    /// Whether `value` satisfies the comparison against `threshold`.
    pub fn breached(self, value: i64, threshold: i64) -> bool {
        match self {
            Operator::Greater => value > threshold,
            Operator::GreaterOrEqual => value >= threshold,
            Operator::Less => value < threshold,
            Operator::LessOrEqual => value <= threshold,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance-count change requested when a rule fires.
///
/// Serialized as the policy string form: `"+2"`, `"-1"`, `"+10%"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Adjustment {
    Delta(i32),
    Percent(i32),
}

impl Adjustment {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let (body, percent) = match s.strip_suffix('%') {
            Some(body) => (body, true),
            None => (s, false),
        };
        if !body.starts_with(['+', '-']) {
            return Err(format!("adjustment {s:?} must start with '+' or '-'"));
        }
        let n: i32 = body
            .parse()
            .map_err(|_| format!("adjustment {s:?} is not a signed integer"))?;
        if n == 0 {
            return Err(format!("adjustment {s:?} is zero"));
        }
        Ok(if percent {
            Adjustment::Percent(n)
        } else {
            Adjustment::Delta(n)
        })
    }

    pub fn is_scale_out(self) -> bool {
        match self {
            Adjustment::Delta(n) | Adjustment::Percent(n) => n > 0,
        }
    }
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adjustment::Delta(n) => write!(f, "{n:+}"),
            Adjustment::Percent(n) => write!(f, "{n:+}%"),
        }
    }
}

impl TryFrom<String> for Adjustment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Adjustment::parse(&s)
    }
}

impl From<Adjustment> for String {
    fn from(a: Adjustment) -> Self {
        a.to_string()
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// One raw sample from one app instance, as served by the metrics source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceMetric {
    pub app_id: AppId,
    pub instance_index: u32,
    #[serde(default)]
    pub collected_at: i64,
    pub name: String,
    #[serde(default)]
    pub unit: String,
    pub value: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// One aggregated sample for an app and metric type.
///
/// An empty `value` means the poll found nothing to aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppMetric {
    pub app_id: AppId,
    pub metric_type: String,
    pub value: String,
    pub unit: String,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
}

impl AppMetric {
    pub fn has_value(&self) -> bool {
        !self.value.is_empty()
    }
}

/// Result ordering for metric queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Asc,
    Desc,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Asc => "asc",
            OrderType::Desc => "desc",
        }
    }
}

// ── Scaling state ──────────────────────────────────────────────────

/// Gate preventing repeated scaling of one app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CooldownRecord {
    pub app_id: AppId,
    /// Nanoseconds since the Unix epoch.
    pub expire_at: i64,
}

/// Time-boxed override of an app's instance bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveSchedule {
    pub app_id: AppId,
    pub schedule_id: String,
    pub instance_min_count: i32,
    pub instance_max_count: i32,
    #[serde(default)]
    pub instance_min_initial_count: i32,
}

/// Current time in nanoseconds since the Unix epoch.
pub fn epoch_nanos() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    i64::try_from(nanos).unwrap_or(i64::MAX)
}
