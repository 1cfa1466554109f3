//! Execution backends: the only places the gateway awaits on external work.

pub mod remote;
pub mod subprocess;

use std::time::Duration;

use foundry_common::{conversation_text, Message};
use serde::Deserialize;
use serde_json::Value;

pub use remote::RemoteBackend;
pub use subprocess::SubprocessBackend;

/// Sampling options forwarded to the provider. Keys are accepted in
/// camelCase or snake_case.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOptions {
    pub temperature: Option<f64>,
    #[serde(alias = "top_p")]
    pub top_p: Option<f64>,
    #[serde(alias = "presence_penalty")]
    pub presence_penalty: Option<f64>,
    #[serde(alias = "frequency_penalty")]
    pub frequency_penalty: Option<f64>,
    #[serde(alias = "max_tokens")]
    pub max_tokens: Option<i64>,
    /// `"json"` asks the provider for a JSON object response.
    #[serde(alias = "response_format")]
    pub response_format: Option<String>,
}

/// One unit of work handed to a backend.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub provider: String,
    pub model: Option<String>,
    pub conversation: Vec<Message>,
    pub options: GenerationOptions,
    pub client_id: Option<String>,
    pub task_type: Option<String>,
}

impl ExecutionRequest {
    pub fn prompt_text(&self) -> String {
        conversation_text(&self.conversation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Exit(i32),
    Http(u16),
}

/// Raw backend output, before the output parser runs.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub output: String,
    pub completion: Completion,
    pub usage: Option<Value>,
    pub model: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Missing OPENAI_API_KEY on server.")]
    MissingApiKey,

    #[error("model is required for provider {0}.")]
    MissingModel(String),

    #[error("Upstream request timed out.")]
    UpstreamTimeout,

    #[error("{body}")]
    Upstream { status: Option<u16>, body: String },

    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Runner timed out.")]
    Timeout,

    #[error("Output exceeded MAX_OUTPUT_BYTES ({limit} bytes).")]
    OutputExceeded { limit: usize },

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum Backend {
    Remote(RemoteBackend),
    Subprocess(SubprocessBackend),
}

impl Backend {
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Remote(_) => "remote",
            Backend::Subprocess(_) => "subprocess",
        }
    }

    /// Output tokens assumed for budgeting when the caller does not ask for
    /// a specific amount: what the backend will actually request.
    pub fn default_max_output_tokens(&self) -> i64 {
        match self {
            Backend::Remote(_) => remote::DEFAULT_MAX_TOKENS,
            Backend::Subprocess(_) => 0,
        }
    }

    /// Run `request` to completion or until `deadline` elapses.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        deadline: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        match self {
            Backend::Remote(remote) => remote.execute(request, deadline).await,
            Backend::Subprocess(sub) => sub.execute(request, deadline).await,
        }
    }
}
