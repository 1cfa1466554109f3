//! Local command-line providers.
//!
//! A run goes `Spawned -> Streaming -> {TimedOut | OutputExceeded | Exited}`
//! and reports exactly one outcome. stdin, stdout and stderr are serviced
//! concurrently under a single deadline armed at spawn time; stdout and
//! stderr share one byte ceiling.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};

use super::{Completion, ExecutionError, ExecutionRequest, ExecutionResult};

pub const PROMPT_PLACEHOLDER: &str = "{{prompt}}";
pub const MODEL_PLACEHOLDER: &str = "{{model}}";

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("argument template uses {placeholder} {count} times, at most once is allowed")]
    DuplicatePlaceholder {
        placeholder: &'static str,
        count: usize,
    },
}

/// Parse a configured argument list: a JSON array of strings, or a plain
/// space separated string. Malformed JSON yields no arguments.
pub fn parse_arg_template(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
            Ok(items) => items
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error=%e, "argument template is not a valid JSON array, ignoring it");
                Vec::new()
            }
        };
    }
    trimmed.split(' ').filter(|s| !s.is_empty()).map(String::from).collect()
}

#[derive(Debug, Clone)]
pub struct SubprocessBackend {
    command: String,
    args: Vec<String>,
    max_output_bytes: usize,
}

/// Captured output of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl SubprocessBackend {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        max_output_bytes: usize,
    ) -> Result<Self, TemplateError> {
        for placeholder in [PROMPT_PLACEHOLDER, MODEL_PLACEHOLDER] {
            let count = args.iter().filter(|a| a.as_str() == placeholder).count();
            if count > 1 {
                return Err(TemplateError::DuplicatePlaceholder { placeholder, count });
            }
        }
        Ok(Self {
            command: command.into(),
            args,
            max_output_bytes,
        })
    }

    /// True when the prompt travels over stdin rather than argv.
    pub fn pipes_prompt(&self) -> bool {
        !self.args.iter().any(|a| a == PROMPT_PLACEHOLDER)
    }

    /// True when the template has a `{{model}}` slot.
    pub fn takes_model(&self) -> bool {
        self.args.iter().any(|a| a == MODEL_PLACEHOLDER)
    }

    /// Substitute placeholders in place; argv positions never shift. A
    /// `{{model}}` slot with no model to fill it is an error.
    pub fn render_args(
        &self,
        model: Option<&str>,
        prompt: &str,
    ) -> Result<Vec<String>, ExecutionError> {
        self.args
            .iter()
            .map(|arg| match arg.as_str() {
                MODEL_PLACEHOLDER => model
                    .map(str::to_string)
                    .ok_or_else(|| ExecutionError::MissingModel(self.command.clone())),
                PROMPT_PLACEHOLDER => Ok(prompt.to_string()),
                _ => Ok(arg.clone()),
            })
            .collect()
    }

    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        deadline: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        if self.takes_model() && request.model.is_none() {
            return Err(ExecutionError::MissingModel(request.provider.clone()));
        }
        let prompt = request.prompt_text();
        let out = self.run(request.model.as_deref(), &prompt, deadline).await?;
        Ok(ExecutionResult {
            output: out.stdout,
            completion: Completion::Exit(0),
            usage: None,
            model: request.model.clone(),
        })
    }

    pub async fn run(
        &self,
        model: Option<&str>,
        prompt: &str,
        deadline: Duration,
    ) -> Result<CommandOutput, ExecutionError> {
        let pipe_prompt = self.pipes_prompt();
        let args = self.render_args(model, prompt)?;

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(if pipe_prompt {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let deadline_at = tokio::time::Instant::now() + deadline;
        tracing::debug!(command=%self.command, pid=?child.id(), pipe_prompt, "command spawned");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            terminate(&mut child).await;
            return Err(ExecutionError::Failed(format!(
                "{} started without captured output streams.",
                self.command
            )));
        };
        let stdin = child.stdin.take();

        let capture = BoundedCapture::new(self.max_output_bytes);
        let streams = async {
            tokio::try_join!(
                feed_stdin(stdin, prompt),
                capture.drain(stdout),
                capture.drain(stderr),
            )
        };

        let (stdout, stderr) = match tokio::time::timeout_at(deadline_at, streams).await {
            Ok(Ok(((), out, err))) => (out, err),
            Ok(Err(CaptureError::Exceeded)) => {
                terminate(&mut child).await;
                tracing::warn!(
                    command=%self.command,
                    limit = self.max_output_bytes,
                    "command output exceeded limit, killed"
                );
                return Err(ExecutionError::OutputExceeded {
                    limit: self.max_output_bytes,
                });
            }
            Ok(Err(CaptureError::Io(e))) => {
                terminate(&mut child).await;
                return Err(ExecutionError::Failed(format!(
                    "failed reading {} output: {e}",
                    self.command
                )));
            }
            Err(_) => return Err(self.timed_out(&mut child, deadline).await),
        };

        let status = match tokio::time::timeout_at(deadline_at, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                terminate(&mut child).await;
                return Err(ExecutionError::Failed(format!(
                    "failed waiting for {}: {e}",
                    self.command
                )));
            }
            Err(_) => return Err(self.timed_out(&mut child, deadline).await),
        };

        let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();

        match status.code() {
            Some(0) => {
                tracing::debug!(command=%self.command, bytes = stdout.len(), "command finished");
                Ok(CommandOutput { stdout, stderr })
            }
            code => {
                tracing::warn!(command=%self.command, ?code, "command failed");
                if !stderr.is_empty() {
                    return Err(ExecutionError::Failed(stderr));
                }
                Err(ExecutionError::Failed(match code {
                    Some(c) => format!("{} exited with code {c}.", self.command),
                    None => format!("{} was terminated by a signal.", self.command),
                }))
            }
        }
    }

    async fn timed_out(&self, child: &mut Child, deadline: Duration) -> ExecutionError {
        terminate(child).await;
        tracing::warn!(
            command=%self.command,
            timeout_ms = deadline.as_millis() as u64,
            "command exceeded deadline, killed"
        );
        ExecutionError::Timeout
    }
}

/// Kill the child if it is still running. Killing an exited child is a no-op.
async fn terminate(child: &mut Child) {
    let _ = child.kill().await;
}

async fn feed_stdin(stdin: Option<ChildStdin>, prompt: &str) -> Result<(), CaptureError> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
        // The command may exit or close its input without reading it all.
        tracing::debug!(error=%e, "stdin write failed");
    }
    drop(stdin);
    Ok(())
}

#[derive(Debug)]
enum CaptureError {
    Exceeded,
    Io(std::io::Error),
}

/// Byte ceiling shared by every stream drained through it.
struct BoundedCapture {
    used: AtomicUsize,
    limit: usize,
}

impl BoundedCapture {
    fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    fn charge(&self, n: usize) -> Result<(), CaptureError> {
        let total = self.used.fetch_add(n, Ordering::SeqCst).saturating_add(n);
        if total > self.limit {
            return Err(CaptureError::Exceeded);
        }
        Ok(())
    }

    async fn drain<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<Vec<u8>, CaptureError> {
        let mut out = Vec::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf).await.map_err(CaptureError::Io)?;
            if n == 0 {
                return Ok(out);
            }
            self.charge(n)?;
            out.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str, max_output_bytes: usize) -> SubprocessBackend {
        SubprocessBackend::new("sh", vec!["-c".into(), script.into()], max_output_bytes).unwrap()
    }

    #[test]
    fn test_parse_arg_template() {
        assert!(parse_arg_template("").is_empty());
        assert!(parse_arg_template("   ").is_empty());
        assert_eq!(
            parse_arg_template("exec  --json {{prompt}}"),
            vec!["exec", "--json", "{{prompt}}"]
        );
        assert_eq!(
            parse_arg_template(r#"["-p", "{{prompt}}", "--model", "{{model}}", 3]"#),
            vec!["-p", "{{prompt}}", "--model", "{{model}}", "3"]
        );
        assert!(parse_arg_template("[not json").is_empty());
    }

    #[test]
    fn test_duplicate_placeholders_rejected() {
        let err = SubprocessBackend::new(
            "codex",
            vec!["{{prompt}}".into(), "{{prompt}}".into()],
            10,
        )
        .unwrap_err();
        assert_eq!(
            err,
            TemplateError::DuplicatePlaceholder {
                placeholder: PROMPT_PLACEHOLDER,
                count: 2
            }
        );

        assert!(SubprocessBackend::new(
            "codex",
            vec!["--model".into(), "{{model}}".into(), "{{model}}".into()],
            10
        )
        .is_err());
    }

    #[test]
    fn test_render_args() {
        let backend = SubprocessBackend::new(
            "claude",
            parse_arg_template(r#"["-p", "{{prompt}}", "--model", "{{model}}"]"#),
            10,
        )
        .unwrap();
        assert!(!backend.pipes_prompt());
        assert!(backend.takes_model());
        assert_eq!(
            backend.render_args(Some("opus"), "write a tavern").unwrap(),
            vec!["-p", "write a tavern", "--model", "opus"]
        );

        let piped = SubprocessBackend::new("codex", vec!["exec".into()], 10).unwrap();
        assert!(piped.pipes_prompt());
        assert!(!piped.takes_model());
        assert_eq!(piped.render_args(None, "ignored").unwrap(), vec!["exec"]);
    }

    #[tokio::test]
    async fn test_model_slot_without_model_is_rejected() {
        let backend = SubprocessBackend::new(
            "sh",
            vec![
                "-c".into(),
                "printf 'model=[%s] prompt=[%s]' \"$1\" \"$2\"".into(),
                "--model".into(),
                MODEL_PLACEHOLDER.into(),
                PROMPT_PLACEHOLDER.into(),
            ],
            1024,
        )
        .unwrap();
        assert!(matches!(
            backend.render_args(None, "x"),
            Err(ExecutionError::MissingModel(_))
        ));
        let err = backend
            .run(None, "write a tavern", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MissingModel(_)));

        let out = backend
            .run(Some("opus"), "write a tavern", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "model=[opus] prompt=[write a tavern]");
    }

    #[tokio::test]
    async fn test_prompt_is_piped_to_stdin() {
        let out = sh("cat", 1024)
            .run(None, "  hello from stdin \n", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello from stdin");
    }

    #[tokio::test]
    async fn test_prompt_and_model_in_argv() {
        let backend = SubprocessBackend::new(
            "sh",
            vec![
                "-c".into(),
                "printf '%s|%s' \"$0\" \"$1\"; cat".into(),
                PROMPT_PLACEHOLDER.into(),
                MODEL_PLACEHOLDER.into(),
            ],
            1024,
        )
        .unwrap();
        // stdin is /dev/null here, so `cat` adds nothing.
        let out = backend
            .run(Some("m1"), "the prompt", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "the prompt|m1");
    }

    #[tokio::test]
    async fn test_output_ceiling_kills_command() {
        let err = sh("head -c 200000 /dev/zero", 1024)
            .run(None, "", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::OutputExceeded { limit: 1024 }));
    }

    #[tokio::test]
    async fn test_stderr_counts_toward_ceiling() {
        let err = sh("head -c 600 /dev/zero; head -c 600 /dev/zero >&2", 1000)
            .run(None, "", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::OutputExceeded { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let started = Instant::now();
        let err = sh("exec sleep 5", 1024)
            .run(None, "", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let err = sh("echo '  boom  ' >&2; exit 3", 1024)
            .run(None, "", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ExecutionError::Failed(msg) => assert_eq!(msg, "boom"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_zero_exit_without_stderr() {
        let err = sh("exit 4", 1024)
            .run(None, "", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ExecutionError::Failed(msg) => assert_eq!(msg, "sh exited with code 4."),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let backend =
            SubprocessBackend::new("/nonexistent/foundry-test-command", Vec::new(), 1024).unwrap();
        let err = backend
            .run(None, "x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_command_ignoring_stdin_still_succeeds() {
        let out = sh("printf '  ok  '", 1024)
            .run(None, &"x".repeat(256 * 1024), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "ok");
    }
}
