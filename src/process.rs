//! External process boundary.
//!
//! Everything Reclaw delegates to other programs (the subagent scheduler, the
//! agent status endpoint, `unzip`) goes through a [`ProcessRunner`]. The
//! production [`SystemProcessRunner`] shells out via `tokio::process`; tests
//! inject a [`ScriptedRunner`] that replays canned responses and records every
//! invocation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Captured result of one process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Best single-line description of a failure, for error messages.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };
        match self.status {
            Some(code) if detail.is_empty() => format!("exit code {}", code),
            Some(code) => format!("exit code {}: {}", code, detail),
            None if detail.is_empty() => "terminated by signal".to_string(),
            None => format!("terminated by signal: {}", detail),
        }
    }
}

/// Runs an external command to completion and captures its output.
///
/// A non-zero exit is *not* an error at this layer; callers inspect
/// [`ProcessOutput::status`]. `Err` means the process could not be run at all.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: &str, args: &[String]) -> Result<ProcessOutput>;
}

/// Shells out with `tokio::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessRunner {
    env: Vec<(String, String)>,
}

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra environment variables applied to every spawned process.
    pub fn with_env(env: Vec<(String, String)>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, command: &str, args: &[String]) -> Result<ProcessOutput> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args).kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", command))?;

        Ok(ProcessOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// One recorded call made against a [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub command: String,
    pub args: Vec<String>,
}

/// Replays a queue of canned responses in order.
///
/// Running past the end of the script yields an error, which surfaces as a
/// spawn failure in the calling code.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<Result<ProcessOutput, String>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, output: ProcessOutput) -> &Self {
        self.lock_responses().push_back(Ok(output));
        self
    }

    /// Queue a spawn failure (the command could not be executed).
    pub fn push_spawn_error(&self, message: impl Into<String>) -> &Self {
        self.lock_responses().push_back(Err(message.into()));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock_responses().len()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<ProcessOutput, String>>> {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, command: &str, args: &[String]) -> Result<ProcessOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedCall {
                command: command.to_string(),
                args: args.to_vec(),
            });
        match self.lock_responses().pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => anyhow::bail!("{}", message),
            None => anyhow::bail!(
                "no scripted response left for '{} {}'",
                command,
                args.join(" ")
            ),
        }
    }
}
