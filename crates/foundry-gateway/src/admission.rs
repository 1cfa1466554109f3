//! Request admission: a fixed-window rate limiter per client and a
//! token/cost budget estimate. Both run before any expensive work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetKind {
    Tokens,
    Cost,
}

impl BudgetKind {
    pub fn message(self) -> &'static str {
        match self {
            BudgetKind::Tokens => "Estimated tokens exceed MAX_TOTAL_TOKENS.",
            BudgetKind::Cost => "Estimated cost exceeds MAX_COST_USD.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Rate limit exceeded. Retry after {retry_after_secs}s.")]
    RateLimited { retry_after_secs: u64 },

    #[error("{}", .kind.message())]
    BudgetExceeded {
        kind: BudgetKind,
        estimate: BudgetEstimate,
        limit: f64,
    },
}

// ── Rate gate ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RateBucket {
    pub count: u64,
    pub window_reset_at: Instant,
}

/// Fixed-window request counter keyed by client identity.
///
/// Buckets live in a sharded map; the check-and-increment for one key runs
/// under that key's entry lock, so two concurrent requests can never both
/// take the last slot.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, RateBucket>,
    max_requests: u64,
    window: Duration,
}

impl RateLimiter {
    /// A non-positive `max_requests` or `window_ms` disables the limiter.
    pub fn new(max_requests: i64, window_ms: i64) -> Self {
        let (max_requests, window) = if max_requests > 0 && window_ms > 0 {
            (max_requests as u64, Duration::from_millis(window_ms as u64))
        } else {
            (0, Duration::ZERO)
        };
        Self {
            buckets: DashMap::new(),
            max_requests,
            window,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_requests > 0
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check(&self, client: &str) -> Result<(), AdmissionError> {
        self.check_at(client, Instant::now())
    }

    pub fn check_at(&self, client: &str, now: Instant) -> Result<(), AdmissionError> {
        if !self.is_enabled() {
            return Ok(());
        }

        // A fresh entry starts already expired so the branch below resets it.
        let mut entry = self
            .buckets
            .entry(client.to_string())
            .or_insert(RateBucket {
                count: 0,
                window_reset_at: now,
            });
        let bucket = entry.value_mut();

        if now >= bucket.window_reset_at {
            *bucket = RateBucket {
                count: 1,
                window_reset_at: now + self.window,
            };
            return Ok(());
        }

        if bucket.count < self.max_requests {
            bucket.count += 1;
            return Ok(());
        }

        let remaining_ms = bucket.window_reset_at.duration_since(now).as_millis();
        let retry_after_secs = u64::try_from(remaining_ms.div_ceil(1000))
            .unwrap_or(u64::MAX)
            .max(1);
        Err(AdmissionError::RateLimited { retry_after_secs })
    }

    /// Count currently recorded for `client`, if a bucket exists.
    pub fn count_for(&self, client: &str) -> Option<u64> {
        self.buckets.get(client).map(|b| b.count)
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets whose window has already ended. An expired bucket would
    /// be replaced on the next request anyway, so this never changes an
    /// admission decision. Returns the number of buckets removed.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, b| b.window_reset_at > now);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            tracing::debug!(
                removed,
                remaining = self.buckets.len(),
                "evicted expired rate buckets"
            );
        }
        removed
    }

    /// Periodically evict expired buckets, once per window.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        let limiter = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(limiter.window);
            tick.tick().await;
            loop {
                tick.tick().await;
                limiter.sweep_expired_at(Instant::now());
            }
        }))
    }
}

// ── Budget gate ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_total_tokens: u64,
    /// Unrounded; serialized to 6 decimal places. `None` when the provider
    /// has no price.
    #[serde(serialize_with = "serialize_usd")]
    pub estimated_cost_usd: Option<f64>,
}

impl BudgetEstimate {
    /// Cost as reported to callers, rounded to 6 decimal places.
    pub fn reported_cost_usd(&self) -> Option<f64> {
        self.estimated_cost_usd.map(round6)
    }
}

fn serialize_usd<S: serde::Serializer>(cost: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
    cost.map(round6).serialize(s)
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetPolicy {
    pub chars_per_token: f64,
    /// Non-positive disables the token ceiling.
    pub max_total_tokens: i64,
    /// Non-positive disables the cost ceiling.
    pub max_cost_usd: f64,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
            max_total_tokens: 0,
            max_cost_usd: 0.0,
        }
    }
}

impl BudgetPolicy {
    pub fn estimate(
        &self,
        conversation_chars: usize,
        requested_max_output_tokens: i64,
        cost_per_1k_tokens: Option<f64>,
    ) -> BudgetEstimate {
        let chars_per_token = if self.chars_per_token > 0.0 {
            self.chars_per_token
        } else {
            1.0
        };
        let input_tokens = (conversation_chars as f64 / chars_per_token).ceil() as u64;
        let output_tokens = requested_max_output_tokens.max(0) as u64;
        let estimated_total_tokens = input_tokens.saturating_add(output_tokens);
        let estimated_cost_usd = cost_per_1k_tokens
            .filter(|p| *p > 0.0)
            .map(|per_1k| estimated_total_tokens as f64 / 1000.0 * per_1k);

        BudgetEstimate {
            input_tokens,
            output_tokens,
            estimated_total_tokens,
            estimated_cost_usd,
        }
    }

    pub fn check(&self, estimate: &BudgetEstimate) -> Result<(), AdmissionError> {
        if self.max_total_tokens > 0 && estimate.estimated_total_tokens > self.max_total_tokens as u64
        {
            return Err(AdmissionError::BudgetExceeded {
                kind: BudgetKind::Tokens,
                estimate: *estimate,
                limit: self.max_total_tokens as f64,
            });
        }

        if self.max_cost_usd > 0.0 {
            if let Some(cost) = estimate.estimated_cost_usd {
                if cost > self.max_cost_usd {
                    return Err(AdmissionError::BudgetExceeded {
                        kind: BudgetKind::Cost,
                        estimate: *estimate,
                        limit: self.max_cost_usd,
                    });
                }
            }
        }

        Ok(())
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

// ── Controller ──────────────────────────────────────────────────────

/// Both admission gates, shared by every request handler.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    pub rate: Arc<RateLimiter>,
    pub budget: BudgetPolicy,
}

impl AdmissionController {
    pub fn new(rate: RateLimiter, budget: BudgetPolicy) -> Self {
        Self {
            rate: Arc::new(rate),
            budget,
        }
    }

    pub fn admit_rate(&self, client: &str) -> Result<(), AdmissionError> {
        self.rate.check(client)
    }

    pub fn admit_budget(
        &self,
        conversation_chars: usize,
        requested_max_output_tokens: i64,
        cost_per_1k_tokens: Option<f64>,
    ) -> Result<BudgetEstimate, AdmissionError> {
        let estimate = self.budget.estimate(
            conversation_chars,
            requested_max_output_tokens,
            cost_per_1k_tokens,
        );
        self.budget.check(&estimate)?;
        Ok(estimate)
    }
}
