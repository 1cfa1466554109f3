use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use foundry_gateway::args::Args;
use foundry_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let tracer_provider = foundry_common::telemetry::init_tracing(
        "foundry-gateway",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .build()
        .context("build http client")?;

    let state = AppState::from_args(&args, http)?;
    let sweeper = state.admission.rate.spawn_sweeper();

    tracing::info!(
        addr = %args.listen_addr,
        providers = ?state.config.providers.names(),
        default_provider = %state.config.default_provider,
        rate_limit_max = args.rate_limit_max,
        rate_limit_window_ms = args.rate_limit_window_ms,
        max_total_tokens = args.max_total_tokens,
        max_cost_usd = args.max_cost_usd,
        "gateway starting"
    );

    let app = foundry_gateway::build_router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("bind {}", args.listen_addr))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serve")?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "failed to flush traces");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
