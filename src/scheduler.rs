//! Client for the external subagent job scheduler.
//!
//! The scheduler CLI (OpenClaw's `cron` command group by default) runs one
//! message as an isolated agent job and records run entries we can poll.
//! Three commands are used:
//!
//! | Operation | Invocation |
//! |-----------|------------|
//! | schedule (legacy) | `cron add --json --name N --at +0s --message M --timeout-seconds T [--model X]` |
//! | schedule (compatible) | `cron add --json --name N --at <ISO now> --session isolated --message M --timeout-seconds T [--model X]` |
//! | poll | `cron runs --id <job> --json` → `{"entries": [{action, status, summary, error, ts}]}` |
//! | cancel | `cron rm <job> --json` |
//!
//! Scheduling tries the legacy dialect first and retries exactly once with
//! the compatible one. Polling uses a fixed interval; there is no backoff.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::process::ProcessRunner;
use crate::util::{format_iso, parse_timestamp_str};
use crate::validate::{decode, parse_object_lenient};

/// Default fixed polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Errors that mean the job finished but only its result delivery failed.
static DELIVERY_ONLY_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(deliver(y|ing)?|announce|channel|recipient|target)\b.*\b(unreachable|unavailable|not (configured|found|reachable|connected)|no route|offline)|no (delivery )?target",
    )
    .expect("static regex")
});

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to schedule subagent job (legacy: {legacy}; compatible: {compatible})")]
    Schedule { legacy: String, compatible: String },
    #[error("timed out after {waited_secs}s waiting for job {job_id}{}", poll_suffix(.last_error))]
    Timeout {
        job_id: String,
        waited_secs: u64,
        last_error: Option<String>,
    },
    #[error("job {job_id} finished with status '{status}': {detail}")]
    JobFailed {
        job_id: String,
        status: String,
        detail: String,
    },
}

fn poll_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last poll error: {})", e))
        .unwrap_or_default()
}

/// Which argument dialect the scheduler accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Legacy,
    Compatible,
}

impl fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleMode::Legacy => f.write_str("legacy"),
            ScheduleMode::Compatible => f.write_str("compatible"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub job_id: String,
    pub mode: ScheduleMode,
}

#[derive(Debug, Deserialize)]
struct RunsResponse {
    #[serde(default)]
    entries: Vec<RunEntry>,
}

#[derive(Debug, Deserialize)]
struct RunEntry {
    #[serde(default)]
    action: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<Value>,
}

impl RunEntry {
    fn ts_millis(&self) -> i64 {
        match &self.ts {
            Some(Value::Number(n)) => n.as_f64().map(|v| v as i64).unwrap_or(0),
            Some(Value::String(s)) => parse_timestamp_str(s)
                .map(|dt| dt.timestamp_millis())
                .unwrap_or(0),
            _ => 0,
        }
    }
}

/// Schedules, polls, and cancels subagent jobs through a [`ProcessRunner`].
pub struct JobScheduler {
    runner: Arc<dyn ProcessRunner>,
    command: String,
    poll_interval: Duration,
}

impl JobScheduler {
    pub fn new(runner: Arc<dyn ProcessRunner>, command: impl Into<String>) -> Self {
        Self {
            runner,
            command: command.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn runner(&self) -> &Arc<dyn ProcessRunner> {
        &self.runner
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Schedule `message` to run immediately as a subagent job.
    pub async fn schedule(
        &self,
        message: &str,
        model: Option<&str>,
        session_name: Option<&str>,
        timeout_seconds: u64,
    ) -> Result<ScheduledJob, SchedulerError> {
        let name = session_name.unwrap_or("reclaw");

        let legacy_args = add_args(name, "+0s", None, message, timeout_seconds, model);
        let legacy = match self.try_schedule(&legacy_args).await {
            Ok(job_id) => {
                return Ok(ScheduledJob {
                    job_id,
                    mode: ScheduleMode::Legacy,
                })
            }
            Err(detail) => detail,
        };
        log::debug!("legacy schedule failed, retrying compatible dialect: {}", legacy);

        let now = format_iso(chrono::Utc::now());
        let compatible_args =
            add_args(name, &now, Some("isolated"), message, timeout_seconds, model);
        match self.try_schedule(&compatible_args).await {
            Ok(job_id) => Ok(ScheduledJob {
                job_id,
                mode: ScheduleMode::Compatible,
            }),
            Err(compatible) => Err(SchedulerError::Schedule { legacy, compatible }),
        }
    }

    async fn try_schedule(&self, args: &[String]) -> Result<String, String> {
        let output = self
            .runner
            .run(&self.command, args)
            .await
            .map_err(|e| format!("{:#}", e))?;
        if !output.success() {
            return Err(output.failure_detail());
        }
        let value = parse_object_lenient("schedule response", &output.stdout)
            .map_err(|e| e.to_string())?;
        extract_job_id(&value).ok_or_else(|| "schedule response did not include a job id".to_string())
    }

    /// Poll until a terminal `finished` entry for `job_id` appears, or the
    /// timeout elapses.
    pub async fn await_result(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<String, SchedulerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let args = vec![
            "cron".to_string(),
            "runs".to_string(),
            "--id".to_string(),
            job_id.to_string(),
            "--json".to_string(),
        ];
        let mut last_error = None;

        loop {
            match self.runner.run(&self.command, &args).await {
                Ok(output) if output.success() => match latest_finished(&output.stdout) {
                    Ok(Some(entry)) => return finished_entry_result(job_id, entry),
                    Ok(None) => {}
                    Err(detail) => last_error = Some(detail),
                },
                Ok(output) => last_error = Some(output.failure_detail()),
                Err(e) => {
                    log::debug!("poll for job {} failed: {:#}", job_id, e);
                    last_error = Some(format!("{:#}", e));
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(SchedulerError::Timeout {
                    job_id: job_id.to_string(),
                    waited_secs: timeout.as_secs(),
                    last_error,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Remove a job. Failures are logged and swallowed.
    pub async fn cancel(&self, job_id: &str) {
        let args = vec![
            "cron".to_string(),
            "rm".to_string(),
            job_id.to_string(),
            "--json".to_string(),
        ];
        match self.runner.run(&self.command, &args).await {
            Ok(output) if output.success() => {}
            Ok(output) => log::debug!("cancel {} failed: {}", job_id, output.failure_detail()),
            Err(e) => log::debug!("cancel {} failed: {:#}", job_id, e),
        }
    }
}

fn add_args(
    name: &str,
    at: &str,
    session: Option<&str>,
    message: &str,
    timeout_seconds: u64,
    model: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = ["cron", "add", "--json", "--name", name, "--at", at]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if let Some(session) = session {
        args.push("--session".to_string());
        args.push(session.to_string());
    }
    args.push("--message".to_string());
    args.push(message.to_string());
    args.push("--timeout-seconds".to_string());
    args.push(timeout_seconds.to_string());
    if let Some(model) = model {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    args
}

fn extract_job_id(value: &Value) -> Option<String> {
    let candidates = [
        value.get("id"),
        value.get("jobId"),
        value.get("job").and_then(|job| job.get("id")),
    ];
    candidates.into_iter().flatten().find_map(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn latest_finished(stdout: &str) -> Result<Option<RunEntry>, String> {
    let value = parse_object_lenient("job status", stdout).map_err(|e| e.to_string())?;
    let runs: RunsResponse = decode("job status", value).map_err(|e| e.to_string())?;
    Ok(runs
        .entries
        .into_iter()
        .filter(|entry| entry.action == "finished")
        .max_by_key(RunEntry::ts_millis))
}

fn finished_entry_result(job_id: &str, entry: RunEntry) -> Result<String, SchedulerError> {
    let summary = entry.summary.unwrap_or_default();
    let status = entry.status.unwrap_or_else(|| "ok".to_string());
    if status == "ok" {
        return Ok(summary);
    }

    let detail = entry.error.unwrap_or_default();
    if status == "error" && is_delivery_only_error(&detail) && !summary.trim().is_empty() {
        log::warn!(
            "job {} reported a delivery error, keeping its summary: {}",
            job_id,
            detail
        );
        return Ok(summary);
    }

    Err(SchedulerError::JobFailed {
        job_id: job_id.to_string(),
        status,
        detail: if detail.is_empty() {
            "no error detail".to_string()
        } else {
            detail
        },
    })
}

/// True when an error message only concerns delivering the result.
pub fn is_delivery_only_error(detail: &str) -> bool {
    DELIVERY_ONLY_ERROR.is_match(detail)
}
