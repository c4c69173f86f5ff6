//! Shell command execution pinned to a worktree directory.

use corral_runtime::{ExecutionResult, InputStream, OutputChunk, OutputStream, RuntimeError};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

pub(crate) fn shell(cwd: &Path, command: &str, env: &BTreeMap<String, String>) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

fn launch(mut cmd: Command, command: &str) -> Result<Child, RuntimeError> {
    cmd.spawn().map_err(|e| {
        RuntimeError::execution(format!("failed to launch shell: {e}"), None)
            .with_context("command", command)
    })
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Run to completion, optionally feeding `stdin`, and collect the output.
///
/// A non-zero exit is a normal result. Only launch failures and the deadline
/// produce errors; on timeout the child is killed.
pub(crate) async fn run(
    mut cmd: Command,
    command: &str,
    stdin: Option<InputStream>,
    timeout: Duration,
) -> Result<ExecutionResult, RuntimeError> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    }
    let started = Instant::now();
    let mut child = launch(cmd, command)?;

    if let (Some(mut input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut input, &mut pipe).await {
                // The command may exit without draining stdin.
                debug!("stdin copy ended early: {e}");
            }
        });
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(
                RuntimeError::execution(format!("failed to wait for command: {e}"), None)
                    .with_context("command", command),
            )
        }
        Err(_) => {
            warn!("command timed out after {timeout:?}: {command}");
            return Err(RuntimeError::timeout("execute", timeout).with_context("command", command));
        }
    };

    Ok(ExecutionResult {
        exit_code: exit_code(output.status),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: started.elapsed(),
    })
}

/// Launch and return a pull-based stream of output chunks ending in `Exit`.
///
/// Output is read only as the consumer polls, so a slow consumer applies
/// backpressure through the pipe instead of losing data.
pub(crate) fn stream(cmd: Command, command: &str, timeout: Duration) -> Result<OutputStream, RuntimeError> {
    let mut child = launch(cmd, command)?;
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(RuntimeError::execution("child pipes unavailable", None)
            .with_context("command", command));
    };

    let deadline = tokio::time::Instant::now() + timeout;
    let command = command.to_owned();
    let read_error = |e: std::io::Error| RuntimeError::execution(format!("output read failed: {e}"), None);

    let out = ReaderStream::new(stdout).map(move |r| r.map(OutputChunk::Stdout).map_err(read_error));
    let err = ReaderStream::new(stderr).map(move |r| r.map(OutputChunk::Stderr).map_err(read_error));
    let output = stream::select(out, err).take_until(tokio::time::sleep_until(deadline));

    let exit = stream::once(async move {
        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => Ok(OutputChunk::Exit(exit_code(status))),
            Ok(Err(e)) => Err(RuntimeError::execution(format!("failed to wait for command: {e}"), None)
                .with_context("command", &command)),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("failed to kill timed out command: {e}");
                }
                Err(RuntimeError::timeout("execute_stream", timeout).with_context("command", &command))
            }
        }
    });

    Ok(output.chain(exit).boxed())
}
