use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use crate::args::Args;
use crate::backend::subprocess::parse_arg_template;
use crate::backend::{Backend, RemoteBackend, SubprocessBackend};

/// A named provider bound to one execution backend.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub backend: Backend,
    pub default_model: Option<String>,
    pub cost_per_1k_tokens: Option<f64>,
    pub timeout: Duration,
}

impl Provider {
    pub fn resolve_model(&self, requested: Option<&str>) -> Option<String> {
        requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_model.clone())
    }

    pub fn summary(&self) -> ProviderSummary {
        ProviderSummary {
            name: self.name.clone(),
            kind: self.backend.kind(),
            default_model: self.default_model.clone(),
            cost_per_1k_tokens: self.cost_per_1k_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub name: String,
    pub kind: &'static str,
    pub default_model: Option<String>,
    pub cost_per_1k_tokens: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Provider>,
}

impl ProviderRegistry {
    pub fn insert(&mut self, provider: Provider) {
        self.providers.insert(provider.name.clone(), provider);
    }

    /// Lookup is case-insensitive; names are stored lowercase.
    pub fn get(&self, name: &str) -> Option<&Provider> {
        self.providers.get(&name.trim().to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn summaries(&self) -> Vec<ProviderSummary> {
        self.providers.values().map(Provider::summary).collect()
    }
}

/// How cross-origin requests are answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsPolicy {
    AllowAll,
    AllowOrigins(Vec<String>),
}

impl CorsPolicy {
    pub fn from_list(raw: Option<&str>) -> Self {
        let origins: Vec<String> = raw
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        if origins.is_empty() {
            CorsPolicy::AllowAll
        } else {
            CorsPolicy::AllowOrigins(origins)
        }
    }
}

/// Request-path settings resolved from the command line and environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub default_provider: String,
    pub default_model: String,
    pub max_prompt_chars: usize,
    pub cors: CorsPolicy,
    pub providers: ProviderRegistry,
}

impl GatewayConfig {
    pub fn from_args(args: &Args, http: reqwest::Client) -> anyhow::Result<Self> {
        let default_model = args.default_model.trim().to_string();
        let mut providers = ProviderRegistry::default();

        let remote = RemoteBackend::new(
            http,
            args.openai_base_url.clone(),
            args.openai_api_key.clone(),
        );
        if !remote.has_api_key() {
            tracing::warn!("OPENAI_API_KEY not set: openai requests will fail with 500");
        }
        providers.insert(Provider {
            name: "openai".into(),
            backend: Backend::Remote(remote),
            default_model: Some(default_model.clone()).filter(|m| !m.is_empty()),
            cost_per_1k_tokens: args.cost_per_1k_tokens_openai,
            timeout: Duration::from_millis(args.request_timeout_ms),
        });

        for (name, command, raw_args, cost) in [
            (
                "codex",
                &args.codex_command,
                &args.codex_args,
                args.cost_per_1k_tokens_codex,
            ),
            (
                "claude",
                &args.claude_command,
                &args.claude_args,
                args.cost_per_1k_tokens_claude,
            ),
        ] {
            let backend = SubprocessBackend::new(
                command.clone(),
                parse_arg_template(raw_args),
                args.max_output_bytes,
            )
            .with_context(|| format!("invalid argument template for provider {name}"))?;
            providers.insert(Provider {
                name: name.into(),
                backend: Backend::Subprocess(backend),
                default_model: None,
                cost_per_1k_tokens: cost,
                timeout: Duration::from_millis(args.runner_timeout_ms),
            });
        }

        let default_provider = args.default_provider.trim().to_ascii_lowercase();
        if providers.get(&default_provider).is_none() {
            anyhow::bail!(
                "DEFAULT_PROVIDER {default_provider:?} is not one of {:?}",
                providers.names()
            );
        }

        Ok(Self {
            default_provider,
            default_model,
            max_prompt_chars: args.max_prompt_chars,
            cors: CorsPolicy::from_list(args.allowed_origins.as_deref()),
            providers,
        })
    }
}
