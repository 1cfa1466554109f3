use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use foundry_common::{
    conversation_chars, normalize_messages, parse_output, ConversationInput, NormalizeError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use crate::admission::BudgetEstimate;
use crate::backend::{Backend, ExecutionRequest, ExecutionResult, GenerationOptions};
use crate::config::Provider;
use crate::error::GatewayError;
use crate::state::AppState;

const ANONYMOUS_CLIENT: &str = "anonymous";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt: Option<Value>,
    pub system: Option<Value>,
    pub messages: Option<Value>,
    pub options: Option<GenerationOptions>,
    pub task_type: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliRunRequest {
    pub provider: Option<String>,
    pub prompt: Option<Value>,
    pub model: Option<String>,
    pub options: Option<GenerationOptions>,
    pub client_id: Option<String>,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

pub async fn list_providers(State(st): State<AppState>) -> impl IntoResponse {
    let cfg = &st.config;
    Json(json!({
        "providers": cfg.providers.names(),
        "defaultProvider": cfg.default_provider,
        "defaultModel": cfg.default_model,
        "providerDetails": cfg.providers.summaries(),
    }))
}

pub async fn generate(
    State(st): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<Value>, GatewayError> {
    let request_id = new_request_id();
    let span = tracing::info_span!("generate", request_id = %request_id);
    let result = handle_generate(&st, peer, body).instrument(span).await;
    record_outcome(&st, result)
}

pub async fn cli_run(
    State(st): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<CliRunRequest>, JsonRejection>,
) -> Result<Json<Value>, GatewayError> {
    let request_id = new_request_id();
    let span = tracing::info_span!("cli_run", request_id = %request_id);
    let result = handle_cli_run(&st, peer, body).instrument(span).await;
    record_outcome(&st, result)
}

async fn handle_generate(
    st: &AppState,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<Value>, GatewayError> {
    let Json(req) = body.map_err(invalid_body)?;
    let client = client_identity(req.client_id.as_deref(), peer.as_ref());
    st.admission.admit_rate(&client)?;

    let provider_name = req
        .provider
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(st.config.default_provider.as_str());
    let provider = st
        .config
        .providers
        .get(provider_name)
        .ok_or_else(|| GatewayError::invalid(format!("Unsupported provider: {provider_name}.")))?;

    let input = ConversationInput {
        messages: req.messages.as_ref(),
        prompt: req.prompt.as_ref(),
        system: req.system.as_ref(),
    };
    let (result, _) = admit_and_execute(
        st,
        provider,
        input,
        Submission {
            model: req.model,
            options: req.options.unwrap_or_default(),
            client_id: req.client_id,
            task_type: req.task_type,
        },
        GatewayError::from,
    )
    .await?;

    let model = result.model.clone();
    let envelope = parse_output(&result.output).with_usage(result.usage);
    Ok(Json(json!({
        "content": envelope.content,
        "payload": envelope.payload,
        "usage": envelope.usage,
        "model": model,
    })))
}

async fn handle_cli_run(
    st: &AppState,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<CliRunRequest>, JsonRejection>,
) -> Result<Json<Value>, GatewayError> {
    let Json(req) = body.map_err(invalid_body)?;
    let client = client_identity(req.client_id.as_deref(), peer.as_ref());
    st.admission.admit_rate(&client)?;

    let provider = req
        .provider
        .as_deref()
        .and_then(|name| st.config.providers.get(name))
        .filter(|p| matches!(p.backend, Backend::Subprocess(_)))
        .ok_or_else(|| GatewayError::invalid("Unsupported provider."))?;

    let input = ConversationInput {
        prompt: req.prompt.as_ref(),
        ..ConversationInput::default()
    };
    let (result, estimate) = admit_and_execute(
        st,
        provider,
        input,
        Submission {
            model: req.model,
            options: req.options.unwrap_or_default(),
            client_id: req.client_id,
            task_type: None,
        },
        |_| GatewayError::invalid("prompt is required."),
    )
    .await?;

    let envelope = parse_output(&result.output);
    Ok(Json(json!({
        "content": envelope.content,
        "payload": envelope.payload,
        "usage": {"estimatedCostUsd": estimate.reported_cost_usd()},
    })))
}

/// Caller-controlled fields that travel with the conversation.
struct Submission {
    model: Option<String>,
    options: GenerationOptions,
    client_id: Option<String>,
    task_type: Option<String>,
}

/// Everything after the rate gate: normalize, check size, budget, execute.
async fn admit_and_execute(
    st: &AppState,
    provider: &Provider,
    input: ConversationInput<'_>,
    submission: Submission,
    on_empty: impl FnOnce(NormalizeError) -> GatewayError,
) -> Result<(ExecutionResult, BudgetEstimate), GatewayError> {
    let conversation = normalize_messages(input).map_err(on_empty)?;
    let chars = conversation_chars(&conversation);
    if chars > st.config.max_prompt_chars {
        return Err(GatewayError::invalid("prompt exceeds MAX_PROMPT_CHARS."));
    }

    let requested_output = submission
        .options
        .max_tokens
        .unwrap_or_else(|| provider.backend.default_max_output_tokens());
    let estimate =
        st.admission
            .admit_budget(chars, requested_output, provider.cost_per_1k_tokens)?;

    let request = ExecutionRequest {
        provider: provider.name.clone(),
        model: provider.resolve_model(submission.model.as_deref()),
        conversation,
        options: submission.options,
        client_id: submission.client_id,
        task_type: submission.task_type,
    };

    st.metrics
        .executions_total
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let started = Instant::now();
    let result = provider.backend.execute(&request, provider.timeout).await?;

    tracing::info!(
        provider = %provider.name,
        backend = provider.backend.kind(),
        model = request.model.as_deref().unwrap_or_default(),
        completion = ?result.completion,
        input_tokens = estimate.input_tokens,
        estimated_total_tokens = estimate.estimated_total_tokens,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request executed"
    );
    Ok((result, estimate))
}

fn record_outcome(
    st: &AppState,
    result: Result<Json<Value>, GatewayError>,
) -> Result<Json<Value>, GatewayError> {
    if let Err(e) = &result {
        st.metrics.record_error(e);
        if e.status().is_server_error() {
            tracing::warn!(kind = e.kind(), error = %e, "request failed");
        } else {
            tracing::debug!(kind = e.kind(), error = %e, "request rejected");
        }
    }
    result
}

fn invalid_body(rejection: JsonRejection) -> GatewayError {
    GatewayError::invalid(format!("Invalid JSON body: {}", rejection.body_text()))
}

fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4())
}

/// Explicit client id, else the peer address, else a shared bucket.
pub fn client_identity(explicit: Option<&str>, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    match peer {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => ANONYMOUS_CLIENT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_identity_precedence() {
        let peer = ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 51234)));
        assert_eq!(client_identity(Some("gm-1"), Some(&peer)), "gm-1");
        assert_eq!(client_identity(Some("  "), Some(&peer)), "10.0.0.7");
        assert_eq!(client_identity(None, Some(&peer)), "10.0.0.7");
        assert_eq!(client_identity(None, None), "anonymous");
    }

    #[test]
    fn test_request_bodies_accept_optional_fields() {
        let req: GenerateRequest = serde_json::from_value(json!({
            "prompt": "hi",
            "taskType": "npc",
            "clientId": "c1",
            "options": {"max_tokens": 12, "responseFormat": "json"}
        }))
        .unwrap();
        assert_eq!(req.task_type.as_deref(), Some("npc"));
        assert_eq!(req.client_id.as_deref(), Some("c1"));
        let options = req.options.unwrap();
        assert_eq!(options.max_tokens, Some(12));
        assert_eq!(options.response_format.as_deref(), Some("json"));

        let run: CliRunRequest = serde_json::from_value(json!({"provider": "codex"})).unwrap();
        assert!(run.prompt.is_none());
        assert!(run.options.is_none());
    }
}
