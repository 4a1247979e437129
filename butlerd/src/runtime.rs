//! The LLM runtime adapter this daemon actually wires up.
//!
//! `butler-core`'s `SessionRuntime` trait is deliberately adapter-agnostic
//! (`SPEC_FULL.md` §E: the real subprocess wrapper is out of scope for the
//! core crate). `ProcessRuntime` is the narrow command-exec shim the daemon
//! needs to run at all: it writes the composed prompt to a child process's
//! stdin and reads its stdout back as the session text. It does not attempt
//! tool-call parsing, streaming, or provider-specific protocols.

use async_trait::async_trait;
use butler_core::prelude::*;
use butler_core::spawner::{SessionOutput, SessionRuntime};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub struct ProcessRuntime {
    command: String,
    model: String,
}

impl ProcessRuntime {
    pub fn new(command: String, model: String) -> Self {
        Self { command, model }
    }
}

#[async_trait]
impl SessionRuntime for ProcessRuntime {
    async fn run(&self, prompt: &str) -> Result<SessionOutput> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::domain(ErrorKind::InternalError, "runtime_command is empty"))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::domain(
                    ErrorKind::TargetUnavailable,
                    format!("failed to spawn runtime command '{}': {e}", self.command),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| Error::domain(ErrorKind::TargetUnavailable, e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::domain(ErrorKind::TargetUnavailable, e.to_string()))?;

        if !output.status.success() {
            return Err(Error::domain(
                ErrorKind::TargetUnavailable,
                format!(
                    "runtime command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        Ok(SessionOutput {
            model: self.model.clone(),
            input_tokens: None,
            output_tokens: None,
            tool_calls: None,
            cost: None,
        })
    }
}

/// Used when no `spawner.runtime_command` is configured: every trigger
/// fails fast with `target_unavailable` rather than silently no-op'ing.
pub struct UnconfiguredRuntime;

#[async_trait]
impl SessionRuntime for UnconfiguredRuntime {
    async fn run(&self, _prompt: &str) -> Result<SessionOutput> {
        Err(Error::domain(
            ErrorKind::TargetUnavailable,
            "no spawner.runtime_command configured for this butler",
        ))
    }
}
