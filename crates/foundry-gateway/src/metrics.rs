use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::GatewayError;
use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub unauthorized: AtomicU64,
    pub rate_limited: AtomicU64,
    pub budget_exceeded: AtomicU64,
    pub executions_total: AtomicU64,
    pub execution_timeouts: AtomicU64,
    pub execution_failures: AtomicU64,
    pub output_exceeded: AtomicU64,
}

impl Metrics {
    /// Count a rejection or failure by its kind. 401s are counted by
    /// `track_requests` since the authenticator answers before any handler.
    pub fn record_error(&self, err: &GatewayError) {
        let counter = match err {
            GatewayError::RateLimited { .. } => &self.rate_limited,
            GatewayError::BudgetExceeded { .. } => &self.budget_exceeded,
            GatewayError::UpstreamTimeout | GatewayError::ExecutionTimeout => {
                &self.execution_timeouts
            }
            GatewayError::UpstreamError { .. } | GatewayError::ExecutionFailed(_) => {
                &self.execution_failures
            }
            GatewayError::OutputExceeded(_) => &self.output_exceeded,
            GatewayError::MisconfiguredServer(_) | GatewayError::InvalidRequest(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn render_metrics(metrics: &Metrics) -> String {
    let series: [(&str, &str, &str, &AtomicU64); 12] = [
        ("requests_total", "counter", "Total requests handled by the gateway.", &metrics.requests_total),
        ("requests_inflight", "gauge", "Currently in-flight requests.", &metrics.requests_inflight),
        ("responses_2xx", "counter", "Total 2xx responses.", &metrics.status_2xx),
        ("responses_4xx", "counter", "Total 4xx responses.", &metrics.status_4xx),
        ("responses_5xx", "counter", "Total 5xx responses.", &metrics.status_5xx),
        ("unauthorized_total", "counter", "Requests rejected by the authenticator.", &metrics.unauthorized),
        ("rate_limited_total", "counter", "Requests rejected by the rate gate.", &metrics.rate_limited),
        ("budget_exceeded_total", "counter", "Requests rejected by the budget gate.", &metrics.budget_exceeded),
        ("executions_total", "counter", "Requests handed to an execution backend.", &metrics.executions_total),
        ("execution_timeouts_total", "counter", "Executions that hit their deadline.", &metrics.execution_timeouts),
        ("execution_failures_total", "counter", "Executions that failed upstream or exited non-zero.", &metrics.execution_failures),
        ("output_exceeded_total", "counter", "Commands killed for exceeding the output ceiling.", &metrics.output_exceeded),
    ];

    let mut body = String::new();
    for (name, kind, help, value) in series {
        let _ = write!(
            body,
            "# HELP foundry_gateway_{name} {help}\n\
             # TYPE foundry_gateway_{name} {kind}\n\
             foundry_gateway_{name} {}\n",
            value.load(Ordering::Relaxed),
        );
    }
    body
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let body = render_metrics(&st.metrics);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }
    if status == StatusCode::UNAUTHORIZED.as_u16() {
        st.metrics.unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_every_series() {
        let m = Metrics::default();
        m.requests_total.fetch_add(3, Ordering::Relaxed);
        m.record_error(&GatewayError::RateLimited { retry_after_secs: 1 });
        m.record_error(&GatewayError::ExecutionTimeout);
        m.record_error(&GatewayError::invalid("nope"));

        let text = render_metrics(&m);
        assert!(text.contains("# TYPE foundry_gateway_requests_inflight gauge\n"));
        assert!(text.contains("foundry_gateway_requests_total 3\n"));
        assert!(text.contains("foundry_gateway_rate_limited_total 1\n"));
        assert!(text.contains("foundry_gateway_execution_timeouts_total 1\n"));
        assert!(text.contains("foundry_gateway_budget_exceeded_total 0\n"));
        assert_eq!(text.matches("# HELP ").count(), 12);
    }
}
