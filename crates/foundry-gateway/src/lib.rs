//! Authenticated relay in front of a hosted chat API and local LLM command
//! line tools.

pub mod admission;
pub mod args;
pub mod backend;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod state;

use axum::{
    http::HeaderValue,
    middleware,
    routing::{get, post},
    Router,
};
use foundry_common::auth::auth_middleware;
use tower_http::cors::{Any, CorsLayer};

use crate::config::CorsPolicy;
use crate::handlers::{cli_run, generate, healthz, list_providers};
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

fn build_cors_layer(policy: &CorsPolicy) -> CorsLayer {
    match policy {
        CorsPolicy::AllowAll => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        CorsPolicy::AllowOrigins(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| match o.parse() {
                    Ok(v) => Some(v),
                    Err(_) => {
                        tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/v1/generate", post(generate))
        .route("/v1/cli/run", post(cli_run))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware::<AppState>,
        ));

    Router::new()
        .route("/health", get(healthz))
        .route("/healthz", get(healthz))
        .route("/v1/providers", get(list_providers))
        .route("/metrics", get(metrics_handler))
        .merge(authed)
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(build_cors_layer(&state.config.cors))
        .with_state(state)
}
