//! Assistant Invoker: shells out to the external assistant CLI.
//!
//! One call = one child process. Stdout/stderr are streamed chunk-by-chunk
//! into capture buffers, firing the activity and output sinks as they
//! arrive. The call ends on process exit, call timeout, or cancellation;
//! every outcome is a value ([`InvokeOutcome`] / [`InvokeError`]), never a
//! panic across the core boundary.

pub mod parse;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use parse::{ModelTokens, ParsedResult};

/// Fired on every stdout/stderr chunk, with no payload. Liveness signal.
pub type ActivitySink = Arc<dyn Fn() + Send + Sync>;
/// Fired on every stdout/stderr chunk with the chunk text.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct InvokeSinks {
    pub on_activity: Option<ActivitySink>,
    pub on_output: Option<OutputSink>,
}

impl InvokeSinks {
    fn emit(&self, chunk: &str) {
        if let Some(activity) = &self.on_activity {
            activity();
        }
        if let Some(output) = &self.on_output {
            output(chunk);
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    pub max_turns: u32,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    /// Comma-separated tool names; `Some("")` disables all tools; `None`
    /// leaves the assistant's default tool policy in place.
    pub allowed_tools: Option<String>,
    pub session_id: Option<String>,
    pub cwd: Option<PathBuf>,
    /// `None` means unlimited.
    pub timeout: Option<Duration>,
}

impl InvokeRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_turns: 1,
            system_prompt: None,
            model: None,
            allowed_tools: None,
            session_id: None,
            cwd: None,
            timeout: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("assistant call timed out after {0:?}")]
    Timeout(Duration),
    #[error("assistant call cancelled")]
    Cancelled,
    #[error("assistant rate limited: {0}")]
    RateLimited(String),
    #[error("failed to spawn assistant: {0}")]
    Spawn(String),
    #[error("assistant failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct InvokeOutcome {
    pub text: String,
    pub is_error: bool,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    pub duration_api_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub stop_reason: Option<String>,
    pub model_usage: BTreeMap<String, ModelTokens>,
    /// The parsed JSON payload when one was found in stdout.
    pub raw: Option<Value>,
}

/// The assistant CLI offers no structured error codes, so resume failures
/// are recognized by message content. Single predicate on purpose.
pub fn is_session_resume_error(message: &str) -> bool {
    let message = message.to_lowercase();
    ["session", "resume", "not found", "invalid"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn is_rate_limit(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("rate limit") || message.contains("429")
}

pub struct AssistantInvoker {
    bin: String,
}

impl AssistantInvoker {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Run one assistant call. When the call carried a session handle and
    /// fails with a resume-shaped error, it is retried exactly once without
    /// the handle.
    pub async fn invoke(
        &self,
        request: &InvokeRequest,
        cancel: &CancellationToken,
        sinks: &InvokeSinks,
    ) -> Result<InvokeOutcome, InvokeError> {
        let first = self.invoke_once(request, cancel, sinks).await;

        if request.session_id.is_some()
            && let Err(err) = &first
            && !matches!(err, InvokeError::Cancelled)
            && is_session_resume_error(&err.to_string())
        {
            warn!("Session resume failed ({}), retrying without session", err);
            let mut retry = request.clone();
            retry.session_id = None;
            return self.invoke_once(&retry, cancel, sinks).await;
        }

        first
    }

    async fn invoke_once(
        &self,
        request: &InvokeRequest,
        cancel: &CancellationToken,
        sinks: &InvokeSinks,
    ) -> Result<InvokeOutcome, InvokeError> {
        let started = Instant::now();

        let mut cmd = Command::new(&self.bin);
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--max-turns")
            .arg(request.max_turns.to_string())
            .arg("--verbose")
            .arg("--dangerously-skip-permissions");
        if let Some(system_prompt) = &request.system_prompt {
            cmd.arg("--system-prompt").arg(system_prompt);
        }
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(tools) = &request.allowed_tools {
            cmd.arg("--tools").arg(tools);
        }
        if let Some(session_id) = &request.session_id {
            cmd.arg("--resume").arg(session_id);
        }
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| InvokeError::Spawn(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InvokeError::Spawn("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| InvokeError::Spawn("failed to capture stderr".to_string()))?;

        let stdout_buf: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let stderr_buf: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let stdout_task = tokio::spawn(read_stream(stdout, stdout_buf.clone(), sinks.clone()));
        let stderr_task = tokio::spawn(read_stream(stderr, stderr_buf.clone(), sinks.clone()));

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| InvokeError::Failed(format!("process wait failed: {}", e)))?
            }
            _ = sleep_or_forever(request.timeout) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(InvokeError::Timeout(request.timeout.unwrap_or_default()));
            }
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(InvokeError::Cancelled);
            }
        };

        // Drain the readers so the capture buffers are complete.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let stdout_text = take_buffer(&stdout_buf);
        let stderr_text = take_buffer(&stderr_buf);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if stdout_text.trim().is_empty() {
            let message = if stderr_text.trim().is_empty() {
                format!("assistant exited with {} and no output", status)
            } else {
                stderr_text.trim().to_string()
            };
            if !status.success() && is_rate_limit(&message) {
                return Err(InvokeError::RateLimited(message));
            }
            return Err(InvokeError::Failed(message));
        }

        match parse::extract_json(&stdout_text) {
            Some(value) => {
                let parsed = parse::extract_result(&value);
                debug!(
                    "Assistant call finished in {}ms (cost {:?})",
                    elapsed_ms, parsed.cost_usd
                );
                Ok(InvokeOutcome {
                    text: parsed.text,
                    is_error: parsed.is_error,
                    session_id: parsed.session_id,
                    cost_usd: parsed.cost_usd,
                    duration_ms: parsed.duration_ms.unwrap_or(elapsed_ms),
                    duration_api_ms: parsed.duration_api_ms,
                    num_turns: parsed.num_turns,
                    stop_reason: parsed.stop_reason,
                    model_usage: parsed.model_usage,
                    raw: Some(value),
                })
            }
            // Unparseable but non-empty stdout is still a usable answer.
            None => Ok(InvokeOutcome {
                text: stdout_text.trim().to_string(),
                duration_ms: elapsed_ms,
                ..Default::default()
            }),
        }
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn take_buffer(buf: &Arc<Mutex<String>>) -> String {
    std::mem::take(&mut *buf.lock().unwrap_or_else(|e| e.into_inner()))
}

async fn read_stream<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    buf: Arc<Mutex<String>>,
    sinks: InvokeSinks,
) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]).to_string();
                buf.lock().unwrap_or_else(|e| e.into_inner()).push_str(&text);
                sinks.emit(&text);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stub_script(dir: &tempfile::TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("assistant.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn invoke_parses_json_result() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_script(
            &dir,
            r#"echo '{"type":"result","result":"hello","session_id":"s-1","total_cost_usd":0.05}'"#,
        );
        let invoker = AssistantInvoker::new(bin);
        let outcome = invoker
            .invoke(
                &InvokeRequest::new("hi"),
                &CancellationToken::new(),
                &InvokeSinks::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.text, "hello");
        assert_eq!(outcome.session_id.as_deref(), Some("s-1"));
        assert_eq!(outcome.cost_usd, Some(0.05));
        assert!(!outcome.is_error);
    }

    #[tokio::test]
    async fn invoke_returns_raw_text_when_not_json() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_script(&dir, "echo 'plain words, no braces'");
        let invoker = AssistantInvoker::new(bin);
        let outcome = invoker
            .invoke(
                &InvokeRequest::new("hi"),
                &CancellationToken::new(),
                &InvokeSinks::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.text, "plain words, no braces");
        assert!(!outcome.is_error);
        assert!(outcome.raw.is_none());
    }

    #[tokio::test]
    async fn invoke_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_script(&dir, "sleep 5");
        let invoker = AssistantInvoker::new(bin);
        let mut request = InvokeRequest::new("hi");
        request.timeout = Some(Duration::from_millis(200));
        let err = invoker
            .invoke(&request, &CancellationToken::new(), &InvokeSinks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Timeout(_)));
    }

    #[tokio::test]
    async fn invoke_cancelled_by_token() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_script(&dir, "sleep 5");
        let invoker = AssistantInvoker::new(bin);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let err = invoker
            .invoke(
                &InvokeRequest::new("hi"),
                &cancel,
                &InvokeSinks::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled));
    }

    #[tokio::test]
    async fn invoke_classifies_rate_limit_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_script(&dir, "echo 'API error: 429 too many requests' >&2; exit 1");
        let invoker = AssistantInvoker::new(bin);
        let err = invoker
            .invoke(
                &InvokeRequest::new("hi"),
                &CancellationToken::new(),
                &InvokeSinks::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::RateLimited(_)));
    }

    #[tokio::test]
    async fn invoke_retries_without_session_on_resume_error() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_script(
            &dir,
            r#"for a in "$@"; do
  if [ "$a" = "--resume" ]; then
    echo 'Error: session not found' >&2
    exit 1
  fi
done
echo '{"type":"result","result":"fresh start"}'"#,
        );
        let invoker = AssistantInvoker::new(bin);
        let mut request = InvokeRequest::new("hi");
        request.session_id = Some("stale-session".to_string());
        let outcome = invoker
            .invoke(&request, &CancellationToken::new(), &InvokeSinks::default())
            .await
            .unwrap();
        assert_eq!(outcome.text, "fresh start");
    }

    #[tokio::test]
    async fn invoke_fires_output_and_activity_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_script(&dir, r#"echo '{"type":"result","result":"ok"}'"#);
        let invoker = AssistantInvoker::new(bin);

        let activity_count = Arc::new(AtomicUsize::new(0));
        let captured: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let counter = activity_count.clone();
        let capture = captured.clone();
        let sinks = InvokeSinks {
            on_activity: Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            on_output: Some(Arc::new(move |chunk: &str| {
                capture.lock().unwrap().push_str(chunk);
            })),
        };

        invoker
            .invoke(&InvokeRequest::new("hi"), &CancellationToken::new(), &sinks)
            .await
            .unwrap();

        assert!(activity_count.load(Ordering::SeqCst) >= 1);
        assert!(captured.lock().unwrap().contains("result"));
    }
}
