use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use foundry_common::NormalizeError;
use serde_json::{json, Map, Value};

use crate::admission::{AdmissionError, BudgetEstimate, BudgetKind};
use crate::backend::ExecutionError;

/// Every way a handler can fail, one variant per HTTP outcome. Auth
/// failures never reach a handler; the middleware answers them.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    MisconfiguredServer(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded. Retry after {retry_after_secs}s.")]
    RateLimited { retry_after_secs: u64 },

    #[error("{}", .kind.message())]
    BudgetExceeded {
        kind: BudgetKind,
        estimate: BudgetEstimate,
        limit: f64,
    },

    #[error("Upstream request timed out.")]
    UpstreamTimeout,

    #[error("{message}")]
    UpstreamError {
        status: Option<u16>,
        message: String,
    },

    #[error("Runner timed out.")]
    ExecutionTimeout,

    #[error("{0}")]
    ExecutionFailed(String),

    #[error("{0}")]
    OutputExceeded(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::BudgetExceeded { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamTimeout | GatewayError::ExecutionTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::MisconfiguredServer(_)
            | GatewayError::UpstreamError { .. }
            | GatewayError::ExecutionFailed(_)
            | GatewayError::OutputExceeded(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::MisconfiguredServer(_) => "misconfigured_server",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::BudgetExceeded { .. } => "budget_exceeded",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::UpstreamError { .. } => "upstream_error",
            GatewayError::ExecutionTimeout => "execution_timeout",
            GatewayError::ExecutionFailed(_) => "execution_failed",
            GatewayError::OutputExceeded(_) => "output_exceeded",
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        GatewayError::InvalidRequest(message.into())
    }

    fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("error".into(), json!(self.to_string()));
        match self {
            GatewayError::RateLimited { retry_after_secs } => {
                body.insert("retryAfterSeconds".into(), json!(retry_after_secs));
            }
            GatewayError::BudgetExceeded {
                kind,
                estimate,
                limit,
            } => {
                body.insert("kind".into(), json!(kind));
                if let Ok(Value::Object(fields)) = serde_json::to_value(estimate) {
                    body.extend(fields);
                }
                body.insert("limit".into(), json!(limit));
            }
            GatewayError::UpstreamError {
                status: Some(status),
                ..
            } => {
                body.insert("upstreamStatus".into(), json!(status));
            }
            _ => {}
        }
        Value::Object(body)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut resp = (self.status(), Json(self.body())).into_response();
        if let GatewayError::RateLimited { retry_after_secs } = self {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        resp
    }
}

impl From<NormalizeError> for GatewayError {
    fn from(e: NormalizeError) -> Self {
        GatewayError::InvalidRequest(e.to_string())
    }
}

impl From<AdmissionError> for GatewayError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::RateLimited { retry_after_secs } => {
                GatewayError::RateLimited { retry_after_secs }
            }
            AdmissionError::BudgetExceeded {
                kind,
                estimate,
                limit,
            } => GatewayError::BudgetExceeded {
                kind,
                estimate,
                limit,
            },
        }
    }
}

impl From<ExecutionError> for GatewayError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::MissingApiKey => GatewayError::MisconfiguredServer(e.to_string()),
            ExecutionError::MissingModel(_) => GatewayError::InvalidRequest(e.to_string()),
            ExecutionError::UpstreamTimeout => GatewayError::UpstreamTimeout,
            ExecutionError::Upstream { status, body } => GatewayError::UpstreamError {
                status,
                message: if body.trim().is_empty() {
                    "Upstream request failed.".to_string()
                } else {
                    body
                },
            },
            ExecutionError::Spawn { .. } | ExecutionError::Failed(_) => {
                GatewayError::ExecutionFailed(e.to_string())
            }
            ExecutionError::Timeout => GatewayError::ExecutionTimeout,
            ExecutionError::OutputExceeded { .. } => GatewayError::OutputExceeded(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::MisconfiguredServer("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(GatewayError::invalid("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::from(ExecutionError::Timeout).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::from(ExecutionError::UpstreamTimeout).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::from(ExecutionError::OutputExceeded { limit: 1 }).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::from(ExecutionError::MissingApiKey).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let resp = GatewayError::from(AdmissionError::RateLimited {
            retry_after_secs: 12,
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "12");
        let body = body_json(resp).await;
        assert_eq!(body["retryAfterSeconds"], 12);
        assert!(body["error"].as_str().unwrap().contains("Rate limit"));
    }

    #[tokio::test]
    async fn test_budget_response_carries_estimate() {
        let resp = GatewayError::BudgetExceeded {
            kind: BudgetKind::Cost,
            estimate: BudgetEstimate {
                input_tokens: 100,
                output_tokens: 800,
                estimated_total_tokens: 900,
                estimated_cost_usd: Some(0.009),
            },
            limit: 0.005,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(
            body,
            json!({
                "error": "Estimated cost exceeds MAX_COST_USD.",
                "kind": "cost",
                "inputTokens": 100,
                "outputTokens": 800,
                "estimatedTotalTokens": 900,
                "estimatedCostUsd": 0.009,
                "limit": 0.005
            })
        );
    }

    #[tokio::test]
    async fn test_upstream_error_keeps_status_and_body() {
        let resp = GatewayError::from(ExecutionError::Upstream {
            status: Some(429),
            body: "{\"error\":\"quota\"}".into(),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "{\"error\":\"quota\"}");
        assert_eq!(body["upstreamStatus"], 429);
    }

    #[tokio::test]
    async fn test_execution_failure_message() {
        let resp = GatewayError::from(ExecutionError::Failed("boom".into())).into_response();
        let body = body_json(resp).await;
        assert_eq!(body, json!({"error": "boom"}));
    }
}
