//! HTTP client for the metrics source.

use autoscaler_core::{HttpClient, HttpError};
use autoscaler_state::{InstanceMetric, OrderType};
use thiserror::Error;

/// Errors raised while fetching instance metrics.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("metrics source returned status {0}")]
    Status(u16),

    #[error("malformed metrics response: {0}")]
    Decode(String),
}

/// Reads raw per-instance samples from the metrics source.
#[derive(Clone)]
pub struct MetricsSourceClient {
    http: HttpClient,
    base_url: String,
}

impl MetricsSourceClient {
    pub fn new(base_url: &str, http: HttpClient) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Path segments are percent-encoded.
    pub fn history_url(&self, app_id: &str, metric_type: &str, start: i64, end: i64) -> String {
        format!(
            "{}/v1/apps/{}/metrics_history/{}?start={start}&end={end}&order={}",
            self.base_url,
            urlencoding::encode(app_id),
            urlencoding::encode(metric_type),
            OrderType::Asc.as_str()
        )
    }

    /// Instance samples for `app_id`/`metric_type` in `[start, end]`.
    pub async fn instance_metrics(
        &self,
        app_id: &str,
        metric_type: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<InstanceMetric>, FetchError> {
        let url = self.history_url(app_id, metric_type, start, end);
        let resp = self.http.get(&url).await?;
        if !resp.status.is_success() {
            return Err(FetchError::Status(resp.status.as_u16()));
        }
        serde_json::from_slice(&resp.body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}
