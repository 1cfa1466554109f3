use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "FOUNDRY_GATEWAY_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Token expected in `X-Foundry-Proxy-Token` / `X-Foundry-Runner-Token`.
    /// Authenticated routes answer 500 while this is unset.
    #[arg(long, env = "FOUNDRY_SHARED_SECRET", hide_env_values = true)]
    pub shared_secret: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    #[arg(long, env = "DEFAULT_PROVIDER", default_value = "openai")]
    pub default_provider: String,

    #[arg(long, env = "DEFAULT_MODEL", default_value = "gpt-4o-mini")]
    pub default_model: String,

    /// Comma separated list of origins; any origin is allowed when unset.
    #[arg(long, env = "ALLOWED_ORIGINS")]
    pub allowed_origins: Option<String>,

    /// Deadline for remote provider calls.
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Deadline for command-line providers.
    #[arg(long, env = "RUNNER_TIMEOUT_MS", default_value_t = 60_000)]
    pub runner_timeout_ms: u64,

    #[arg(long, env = "MAX_PROMPT_CHARS", default_value_t = 8_000)]
    pub max_prompt_chars: usize,

    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = 60_000)]
    pub rate_limit_window_ms: i64,

    /// Requests per window per client; 0 disables rate limiting.
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = 0)]
    pub rate_limit_max: i64,

    #[arg(long, env = "TOKEN_CHARS_PER_TOKEN", default_value_t = 4.0)]
    pub token_chars_per_token: f64,

    /// Estimated token ceiling per request; 0 disables the check.
    #[arg(long, env = "MAX_TOTAL_TOKENS", default_value_t = 0)]
    pub max_total_tokens: i64,

    /// Estimated cost ceiling per request in USD; 0 disables the check.
    #[arg(long, env = "MAX_COST_USD", default_value_t = 0.5)]
    pub max_cost_usd: f64,

    #[arg(long, env = "COST_PER_1K_TOKENS_OPENAI")]
    pub cost_per_1k_tokens_openai: Option<f64>,

    #[arg(long, env = "COST_PER_1K_TOKENS_CODEX")]
    pub cost_per_1k_tokens_codex: Option<f64>,

    #[arg(long, env = "COST_PER_1K_TOKENS_CLAUDE")]
    pub cost_per_1k_tokens_claude: Option<f64>,

    /// Combined stdout + stderr ceiling for command-line providers.
    #[arg(long, env = "MAX_OUTPUT_BYTES", default_value_t = 1_000_000)]
    pub max_output_bytes: usize,

    #[arg(long, env = "CODEX_COMMAND", default_value = "codex")]
    pub codex_command: String,

    /// JSON array or space separated list; `{{prompt}}` and `{{model}}` are substituted.
    #[arg(long, env = "CODEX_ARGS", default_value = "", allow_hyphen_values = true)]
    pub codex_args: String,

    #[arg(long, env = "CLAUDE_COMMAND", default_value = "claude")]
    pub claude_command: String,

    #[arg(long, env = "CLAUDE_ARGS", default_value = "", allow_hyphen_values = true)]
    pub claude_args: String,

    /// "text" or "json".
    #[arg(long, env = "FOUNDRY_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// OTLP/HTTP endpoint for exporting traces.
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "OTLP_TOKEN", hide_env_values = true)]
    pub otlp_token: Option<String>,
}
