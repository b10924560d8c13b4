//! HTTP client for the scaling engine.

use autoscaler_core::{HttpClient, HttpError};
use autoscaler_state::{Adjustment, AppId, Operator};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while requesting a scale action.
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("scaling engine returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to encode scale request: {0}")]
    Encode(String),
}

/// Body of `POST /v1/apps/{app}/scale`: the rule that fired plus the
/// instance bounds in effect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScaleRequest {
    pub app_id: AppId,
    pub metric_type: String,
    pub metric_unit: String,
    pub breach_duration_secs: i64,
    pub threshold: i64,
    pub operator: Operator,
    pub cool_down_secs: i64,
    pub adjustment: Adjustment,
    pub instance_min_count: i32,
    pub instance_max_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
}

#[derive(Clone)]
pub struct ScalingEngineClient {
    http: HttpClient,
    base_url: String,
}

impl ScalingEngineClient {
    pub fn new(base_url: &str, http: HttpClient) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn scale_url(&self, app_id: &str) -> String {
        format!("{}/v1/apps/{}/scale", self.base_url, urlencoding::encode(app_id))
    }

    /// Send one scale request. Any non-2xx status is an error.
    pub async fn scale(&self, request: &ScaleRequest) -> Result<(), ScaleError> {
        let body = serde_json::to_vec(request).map_err(|e| ScaleError::Encode(e.to_string()))?;
        let resp = self
            .http
            .post_json(&self.scale_url(&request.app_id), body)
            .await?;
        if !resp.status.is_success() {
            return Err(ScaleError::Status {
                status: resp.status.as_u16(),
                body: String::from_utf8_lossy(&resp.body).into_owned(),
            });
        }
        Ok(())
    }
}
