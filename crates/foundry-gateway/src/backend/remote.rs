use std::time::{Duration, Instant};

use serde_json::{json, Value};

use super::{Completion, ExecutionError, ExecutionRequest, ExecutionResult};

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: i64 = 800;
pub const DEFAULT_TOP_P: f64 = 1.0;

/// OpenAI-compatible chat completions client.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RemoteBackend {
    pub fn new(http: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        deadline: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let api_key = self.api_key.as_deref().ok_or(ExecutionError::MissingApiKey)?;
        let model = request
            .model
            .as_deref()
            .ok_or_else(|| ExecutionError::MissingModel(request.provider.clone()))?;

        let url = format!("{}/chat/completions", self.base_url);
        let body = build_body(request, model);
        let started = Instant::now();

        let call = async {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await
                .map_err(classify_reqwest_error)?;

            let status = resp.status();
            if !status.is_success() {
                let text = match resp.text().await {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            status = status.as_u16(),
                            "failed to read upstream error body"
                        );
                        String::new()
                    }
                };
                return Err(ExecutionError::Upstream {
                    status: Some(status.as_u16()),
                    body: text,
                });
            }

            let data: Value = resp.json().await.map_err(classify_reqwest_error)?;
            Ok::<_, ExecutionError>((status.as_u16(), data))
        };

        let (status, data) = match tokio::time::timeout(deadline, call).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    provider=%request.provider,
                    model,
                    timeout_ms = deadline.as_millis() as u64,
                    "upstream call exceeded deadline"
                );
                return Err(ExecutionError::UpstreamTimeout);
            }
        };

        tracing::info!(
            provider=%request.provider,
            model,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "upstream call completed"
        );

        let content = data
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let usage = data.get("usage").filter(|u| !u.is_null()).cloned();
        let model = data
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string();

        Ok(ExecutionResult {
            output: content,
            completion: Completion::Http(status),
            usage,
            model: Some(model),
        })
    }
}

fn build_body(request: &ExecutionRequest, model: &str) -> Value {
    let opts = &request.options;
    let mut body = json!({
        "model": model,
        "messages": request.conversation,
        "temperature": opts.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        "max_tokens": opts.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "top_p": opts.top_p.unwrap_or(DEFAULT_TOP_P),
        "presence_penalty": opts.presence_penalty.unwrap_or(0.0),
        "frequency_penalty": opts.frequency_penalty.unwrap_or(0.0),
    });

    if opts.response_format.as_deref() == Some("json") {
        body["response_format"] = json!({"type": "json_object"});
    }
    if let Some(client_id) = request.client_id.as_deref().filter(|c| !c.is_empty()) {
        body["user"] = json!(client_id);
    }
    if let Some(task_type) = request.task_type.as_deref().filter(|t| !t.is_empty()) {
        body["metadata"] = json!({"taskType": task_type});
    }
    body
}

fn classify_reqwest_error(error: reqwest::Error) -> ExecutionError {
    if error.is_timeout() {
        return ExecutionError::UpstreamTimeout;
    }
    tracing::error!(error=%error, "upstream request failed");
    ExecutionError::Upstream {
        status: error.status().map(|s| s.as_u16()),
        body: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GenerationOptions;
    use foundry_common::{Message, Role};

    fn request(options: GenerationOptions) -> ExecutionRequest {
        ExecutionRequest {
            provider: "openai".into(),
            model: Some("gpt-4o-mini".into()),
            conversation: vec![
                Message::new(Role::System, "sys"),
                Message::new(Role::User, "hi"),
            ],
            options,
            client_id: None,
            task_type: None,
        }
    }

    #[test]
    fn test_body_defaults() {
        let body = build_body(&request(GenerationOptions::default()), "gpt-4o-mini");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["max_tokens"], 800);
        assert_eq!(body["top_p"], 1.0);
        assert_eq!(body["presence_penalty"], 0.0);
        assert_eq!(body["frequency_penalty"], 0.0);
        assert_eq!(
            body["messages"],
            json!([{"role": "system", "content": "sys"}, {"role": "user", "content": "hi"}])
        );
        assert!(body.get("response_format").is_none());
        assert!(body.get("user").is_none());
        assert!(body.get("metadata").is_none());
    }

    #[test]
    fn test_body_with_options() {
        let mut req = request(GenerationOptions {
            temperature: Some(0.1),
            top_p: Some(0.9),
            presence_penalty: Some(0.5),
            frequency_penalty: Some(0.25),
            max_tokens: Some(64),
            response_format: Some("json".into()),
        });
        req.client_id = Some("gm-1".into());
        req.task_type = Some("npc".into());

        let body = build_body(&req, "m");
        assert_eq!(body["temperature"], 0.1);
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["response_format"], json!({"type": "json_object"}));
        assert_eq!(body["user"], "gm-1");
        assert_eq!(body["metadata"], json!({"taskType": "npc"}));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let backend = RemoteBackend::new(reqwest::Client::new(), "http://127.0.0.1:9".into(), None);
        let err = backend
            .execute(&request(GenerationOptions::default()), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MissingApiKey));
    }

    #[tokio::test]
    async fn test_truncated_error_body_falls_back_to_empty() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Promises 100 bytes, sends 5, then hangs up.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(
                b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 100\r\n\r\nshort",
            )
            .await
            .unwrap();
            sock.shutdown().await.unwrap();
        });

        let backend = RemoteBackend::new(
            reqwest::Client::new(),
            format!("http://{addr}"),
            Some("test-key".into()),
        );
        let err = backend
            .execute(&request(GenerationOptions::default()), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ExecutionError::Upstream { status, body } => {
                assert_eq!(status, Some(503));
                assert!(body.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
