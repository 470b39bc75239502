//! Shell executor: `bash -c` with streamed redaction, output limiting, a
//! command denylist, and filtered child environments.
//!
//! Cancellation is graceful: SIGTERM first, SIGKILL after a short grace
//! window. `kill_on_drop` backstops the case where the engine itself dies
//! mid-step.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use strand_types::error::EngineError;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::{StepResult, CANCELED};
use crate::mcp::filter_sensitive_env;
use crate::redact::{OutputLimiter, RedactionBuffer, Redactor, Utf8Chunker};
use crate::runner::EngineContext;
use crate::store::StateStore;

/// Default cap on accumulated stdout/stderr (1 MiB each).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1_048_576;

/// Grace between SIGTERM and SIGKILL on cancellation.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[allow(clippy::too_many_arguments)]
pub async fn run_shell<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    run_template: &str,
    env_overlay: &HashMap<String, String>,
    workdir: Option<&str>,
    max_output_bytes: Option<usize>,
    expr_ctx: &Value,
    cancel: &CancellationToken,
) -> StepResult {
    let run = match engine.evaluator.evaluate_string(run_template, expr_ctx) {
        Ok(run) => run,
        Err(e) => {
            return StepResult::failed(
                EngineError::Expression {
                    message: e.to_string(),
                    step_id: None,
                }
                .to_string(),
            )
        }
    };

    // Denylist gate on the first argv token.
    let first_token = run.split_whitespace().next().unwrap_or_default();
    if engine
        .config
        .denylist
        .iter()
        .any(|denied| denied == first_token)
    {
        return StepResult::failed(
            EngineError::Security {
                message: format!("command '{first_token}' is denylisted"),
                step_id: None,
            }
            .to_string(),
        );
    }

    // Child env: filtered process env, then the evaluated overlay. Overlay
    // names count as explicitly re-supplied.
    let mut overlay = HashMap::new();
    for (name, template) in env_overlay {
        match engine.evaluator.evaluate_string(template, expr_ctx) {
            Ok(value) => {
                overlay.insert(name.clone(), value);
            }
            Err(e) => {
                return StepResult::failed(
                    EngineError::Expression {
                        message: format!("env '{name}': {e}"),
                        step_id: None,
                    }
                    .to_string(),
                )
            }
        }
    }
    let allow: Vec<String> = overlay.keys().cloned().collect();
    let mut child_env = filter_sensitive_env(std::env::vars(), &allow);
    child_env.extend(overlay);

    let mut command = Command::new("bash");
    command
        .arg("-c")
        .arg(&run)
        .env_clear()
        .envs(&child_env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return StepResult::failed(format!("failed to spawn bash: {e}")),
    };

    let cap = max_output_bytes.unwrap_or(engine.config.default_shell_output_bytes);
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let out_task = tokio::spawn(drain(stdout, engine.redactor.clone(), cap));
    let err_task = tokio::spawn(drain(stderr, engine.redactor.clone(), cap));

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            // Drain what was already produced so the failure record still
            // carries (redacted) partial output.
            let stdout = out_task.await.unwrap_or_default();
            let stderr = err_task.await.unwrap_or_default();
            return StepResult::failed_with_output(
                CANCELED,
                json!({ "stdout": stdout, "stderr": stderr, "code": Value::Null }),
            );
        }
    };

    let stdout = out_task.await.unwrap_or_default();
    let stderr = err_task.await.unwrap_or_default();

    match status {
        Ok(status) => {
            let code = status.code();
            let output = json!({ "stdout": stdout, "stderr": stderr, "code": code });
            if status.success() {
                StepResult::success(output)
            } else {
                StepResult::failed_with_output(
                    format!("command exited with code {}", code.unwrap_or(-1)),
                    output,
                )
            }
        }
        Err(e) => StepResult::failed(format!("failed to wait for child: {e}")),
    }
}

/// Stream a pipe through UTF-8 reassembly, the redactor, and the limiter.
async fn drain<R>(mut reader: R, redactor: Redactor, cap: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunker = Utf8Chunker::new();
    let mut redaction = RedactionBuffer::new(redactor);
    let mut limiter = OutputLimiter::new(cap);
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = chunker.push(&buf[..n]);
                if !text.is_empty() {
                    limiter.push_str(&redaction.push(&text));
                }
            }
            Err(_) => break,
        }
    }
    let tail = chunker.finish();
    if !tail.is_empty() {
        limiter.push_str(&redaction.push(&tail));
    }
    limiter.push_str(&redaction.flush());
    limiter.into_string()
}

/// SIGTERM, wait out the grace window, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_drain_redacts_and_caps() {
        let secrets: HashMap<String, String> =
            [("token".to_string(), "SECRETVALUE".to_string())].into();
        let redactor = Redactor::new(&secrets, &[]);

        let input: &[u8] = b"before SECRETVALUE after";
        let out = drain(input, redactor, 1024).await;
        assert!(!out.contains("SECRETVALUE"));
        assert!(out.contains("***REDACTED***"));

        let redactor = Redactor::new(&HashMap::new(), &[]);
        let long: Vec<u8> = vec![b'x'; 64];
        let out = drain(long.as_slice(), redactor, 16).await;
        assert!(out.ends_with(crate::redact::TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_drain_handles_split_utf8() {
        let redactor = Redactor::new(&HashMap::new(), &[]);
        let out = drain("héllo".as_bytes(), redactor, 1024).await;
        assert_eq!(out, "héllo");
    }
}
