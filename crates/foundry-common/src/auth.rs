use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

/// Header sent by the chat proxy client.
pub const PROXY_TOKEN_HEADER: &str = "x-foundry-proxy-token";
/// Header sent by the command runner client.
pub const RUNNER_TOKEN_HEADER: &str = "x-foundry-runner-token";

// ── AuthError ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized.")]
    Unauthorized,
    #[error("Missing shared secret on server.")]
    MisconfiguredServer,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::MisconfiguredServer => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(serde_json::json!({"error": self.to_string()})),
        )
            .into_response()
    }
}

// ── SharedSecret ────────────────────────────────────────────────────

/// The single token every authenticated route is checked against.
///
/// An unset (or blank) secret fails closed: nothing is admitted.
#[derive(Debug, Clone, Default)]
pub struct SharedSecret {
    secret: Option<Arc<str>>,
}

impl SharedSecret {
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(Arc::from);
        if secret.is_none() {
            tracing::warn!("shared secret not set: every authenticated request will be rejected");
        }
        Self { secret }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(&self, presented: Option<&str>) -> Result<(), AuthError> {
        let Some(expected) = self.secret.as_deref() else {
            return Err(AuthError::MisconfiguredServer);
        };
        match presented {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
            _ => Err(AuthError::Unauthorized),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Middleware ───────────────────────────────────────────────────────
// Generic over any state type S that implements AsRef<SharedSecret>.
// Usage: `middleware::from_fn_with_state(app_state, auth_middleware::<MyAppState>)`

pub async fn auth_middleware<S>(
    State(state): State<S>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible>
where
    S: AsRef<SharedSecret> + Clone + Send + Sync + 'static,
{
    let token = extract_token(&req);
    if let Err(e) = state.as_ref().verify(token) {
        tracing::debug!(error=%e, path=%req.uri().path(), "request rejected by authenticator");
        return Ok(e.into_response());
    }
    Ok(next.run(req).await)
}

fn extract_token(req: &Request<Body>) -> Option<&str> {
    [PROXY_TOKEN_HEADER, RUNNER_TOKEN_HEADER]
        .iter()
        .find_map(|name| req.headers().get(*name).and_then(|v| v.to_str().ok()))
}
