// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded subprocess execution.
//!
//! The sandbox discipline: spawn a child with piped stdio, write the input
//! JSON to stdin (never the command line, which leaks via process
//! listings), read stdout up to a hard cap, forward stderr to `tracing`
//! while keeping a short head for diagnostics, and kill the child when the
//! wall-clock budget expires.

use rumi_core::{ErrorKind, KernelError};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Hard cap on subprocess stdout.
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// How much stderr is retained for diagnostics.
const STDERR_HEAD_BYTES: usize = 500;

/// What to run and with which input.
#[derive(Debug, Clone)]
pub struct SubprocessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Written to the child's stdin, then stdin is closed.
    pub input_json: String,
    pub timeout: Duration,
}

/// Outcome of a bounded run that produced an exit status.
#[derive(Debug)]
pub struct SubprocessOutcome {
    pub exit_ok: bool,
    pub stdout: String,
    pub stderr_head: Option<String>,
}

impl SubprocessOutcome {
    /// Interpret stdout the way handlers are contracted to print it: one
    /// JSON value, or free text returned as a string, or nothing.
    pub fn parse_output(&self) -> Value {
        let trimmed = self.stdout.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
    }
}

/// Run a subprocess under the sandbox discipline.
///
/// Errors use the stable kinds: `timeout` when the budget expires (the
/// child is killed), `response_too_large` when stdout exceeds
/// [`MAX_RESPONSE_SIZE`], `internal_error` for spawn/IO faults. A non-zero
/// exit is NOT an error here — callers map it to `handler_error` so they
/// can attach their own context.
pub async fn run_bounded(spec: SubprocessSpec) -> Result<SubprocessOutcome, KernelError> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| KernelError::internal(format!("failed to spawn {}: {e}", spec.command)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| KernelError::internal("stdin unavailable"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| KernelError::internal("stdout unavailable"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| KernelError::internal("stderr unavailable"))?;

    let input = spec.input_json.into_bytes();
    let run = async {
        // Write the input and close stdin so the child sees EOF.
        stdin.write_all(&input).await?;
        drop(stdin);

        let stdout_task = async {
            let mut buf = Vec::new();
            let mut reader = (&mut stdout).take(MAX_RESPONSE_SIZE as u64 + 1);
            reader.read_to_end(&mut buf).await?;
            drop(reader);
            if buf.len() > MAX_RESPONSE_SIZE {
                // Keep draining so the child never blocks on a full pipe;
                // the oversized output is discarded either way.
                let mut sink = [0u8; 16 * 1024];
                loop {
                    let n = stdout.read(&mut sink).await?;
                    if n == 0 {
                        break;
                    }
                }
            }
            Ok::<Vec<u8>, std::io::Error>(buf)
        };
        let stderr_task = async {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf)
        };

        let (stdout_bytes, stderr_bytes, status) =
            tokio::try_join!(stdout_task, stderr_task, child.wait())?;
        Ok::<_, std::io::Error>((stdout_bytes, stderr_bytes, status))
    };

    let (stdout_bytes, stderr_bytes, status) = match tokio::time::timeout(spec.timeout, run).await {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            return Err(KernelError::internal(format!("subprocess io error: {e}")));
        }
        Err(_) => {
            // kill_on_drop reaps the child; make it explicit anyway.
            return Err(KernelError::new(
                ErrorKind::Timeout,
                format!("timed out after {:.1}s", spec.timeout.as_secs_f64()),
            ));
        }
    };

    if stdout_bytes.len() > MAX_RESPONSE_SIZE {
        return Err(KernelError::new(
            ErrorKind::ResponseTooLarge,
            "Response too large",
        ));
    }

    let stderr_text = String::from_utf8_lossy(&stderr_bytes);
    for line in stderr_text.lines().filter(|l| !l.trim().is_empty()) {
        tracing::warn!(target: "rumi_exec.stderr", "{line}");
    }
    let stderr_head = if stderr_text.trim().is_empty() {
        None
    } else {
        Some(stderr_text.chars().take(STDERR_HEAD_BYTES).collect())
    };

    Ok(SubprocessOutcome {
        exit_ok: status.success(),
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr_head,
    })
}
