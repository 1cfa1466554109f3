use std::sync::Arc;

use foundry_common::SharedSecret;

use crate::admission::{AdmissionController, BudgetPolicy, RateLimiter};
use crate::args::Args;
use crate::config::GatewayConfig;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub auth: SharedSecret,
    pub admission: AdmissionController,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(config: GatewayConfig, auth: SharedSecret, admission: AdmissionController) -> Self {
        Self {
            config: Arc::new(config),
            auth,
            admission,
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn from_args(args: &Args, http: reqwest::Client) -> anyhow::Result<Self> {
        let config = GatewayConfig::from_args(args, http)?;
        let admission = AdmissionController::new(
            RateLimiter::new(args.rate_limit_max, args.rate_limit_window_ms),
            BudgetPolicy {
                chars_per_token: args.token_chars_per_token,
                max_total_tokens: args.max_total_tokens,
                max_cost_usd: args.max_cost_usd,
            },
        );
        Ok(Self::new(
            config,
            SharedSecret::new(args.shared_secret.clone()),
            admission,
        ))
    }
}

impl AsRef<SharedSecret> for AppState {
    fn as_ref(&self) -> &SharedSecret {
        &self.auth
    }
}
