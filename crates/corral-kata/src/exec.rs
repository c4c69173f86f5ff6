//! Exec sessions over the pod API, decoded for callers.

use crate::api::{ApiError, ExecFrame, ExecStream, PodApi};
use crate::shell::quote;
use corral_runtime::{InputStream, OutputChunk, OutputStream, RuntimeError};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::time::Duration;

/// Collected output of one exec session.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Captured {
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_owned()
    }
}

pub(crate) fn sh(script: String) -> Vec<String> {
    vec!["/bin/sh".to_owned(), "-c".to_owned(), script]
}

/// Wrap `command` so it runs in `cwd` with `env` exported.
pub(crate) fn script(cwd: &str, env: &BTreeMap<String, String>, command: &str) -> String {
    let mut script = format!("cd {}", quote(cwd));
    for (k, v) in env {
        script.push_str(&format!(" && export {}={}", quote(k), quote(v)));
    }
    script.push_str(" && ");
    script.push_str(command);
    script
}

/// Drain an exec stream. A stream that ends without an exit frame means the
/// session was cut off.
pub(crate) async fn collect(mut frames: ExecStream) -> Result<Captured, ApiError> {
    let mut captured = Captured::default();
    while let Some(frame) = frames.next().await {
        match frame? {
            ExecFrame::Stdout(b) => captured.stdout.extend_from_slice(&b),
            ExecFrame::Stderr(b) => captured.stderr.extend_from_slice(&b),
            ExecFrame::Exit(code) => {
                captured.exit_code = code;
                return Ok(captured);
            }
        }
    }
    Err(ApiError::Transport(
        "exec stream closed before the command exited".to_owned(),
    ))
}

/// Run `script` in `pod` and wait for it, bounded by `timeout`.
pub(crate) async fn run(
    api: &dyn PodApi,
    pod: &str,
    script: String,
    stdin: Option<InputStream>,
    operation: &str,
    timeout: Duration,
) -> Result<Captured, RuntimeError> {
    let session = async {
        let frames = api.exec(pod, sh(script), stdin).await?;
        collect(frames).await
    };
    match tokio::time::timeout(timeout, session).await {
        Ok(result) => result.map_err(|e| RuntimeError::from(e).with_context("pod", pod)),
        Err(_) => Err(RuntimeError::timeout(operation, timeout).with_context("pod", pod)),
    }
}

/// Convert exec frames to output chunks. The stream ends after `Exit`, or
/// with a timeout error once `timeout` elapses; dropping the frames closes
/// the session.
pub(crate) fn output(frames: ExecStream, command: &str, timeout: Duration) -> OutputStream {
    let deadline = tokio::time::Instant::now() + timeout;
    let command = command.to_owned();

    stream::unfold(Some(frames), move |state| {
        let command = command.clone();
        async move {
            let mut frames = state?;
            let item = match tokio::time::timeout_at(deadline, frames.next()).await {
                Ok(Some(Ok(ExecFrame::Stdout(b)))) => return Some((Ok(OutputChunk::Stdout(b)), Some(frames))),
                Ok(Some(Ok(ExecFrame::Stderr(b)))) => return Some((Ok(OutputChunk::Stderr(b)), Some(frames))),
                Ok(Some(Ok(ExecFrame::Exit(code)))) => Ok(OutputChunk::Exit(code)),
                Ok(Some(Err(e))) => Err(RuntimeError::from(e).with_context("command", &command)),
                Ok(None) => Err(RuntimeError::execution(
                    "exec stream closed before the command exited",
                    None,
                )
                .with_context("command", &command)),
                Err(_) => Err(RuntimeError::timeout("execute_stream", timeout)
                    .with_context("command", &command)),
            };
            Some((item, None))
        }
    })
    .boxed()
}
