use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::managed_docs::BackupMode;
use crate::models::ExtractionMode;

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "reclaw.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    #[serde(default = "default_mode")]
    pub mode: ExtractionMode,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_true")]
    pub include_session_refs: bool,
    #[serde(default = "default_true")]
    pub allow_untagged_facts: bool,
    #[serde(default)]
    pub backup_mode: BackupMode,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            model: None,
            max_parallel_jobs: default_max_parallel_jobs(),
            max_prompt_chars: default_max_prompt_chars(),
            include_session_refs: true,
            allow_untagged_facts: true,
            backup_mode: BackupMode::default(),
            state_path: default_state_path(),
        }
    }
}

fn default_mode() -> ExtractionMode {
    ExtractionMode::Openclaw
}
fn default_max_parallel_jobs() -> usize {
    4
}
fn default_max_prompt_chars() -> usize {
    crate::prompt::DEFAULT_MAX_PROMPT_CHARS
}
fn default_true() -> bool {
    true
}
fn default_state_path() -> PathBuf {
    PathBuf::from(".reclaw/state.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_command")]
    pub command: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Extra environment applied to every scheduler invocation.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command: default_scheduler_command(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            wait_timeout_secs: default_wait_timeout_secs(),
            env: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

fn default_scheduler_command() -> String {
    "openclaw".to_string()
}
fn default_poll_interval_ms() -> u64 {
    3_000
}
fn default_job_timeout_secs() -> u64 {
    1_800
}
fn default_wait_timeout_secs() -> u64 {
    1_900
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SessionsConfig {
    /// Agent state directory; `~/.openclaw` when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl SessionsConfig {
    pub fn resolved_state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => dirs::home_dir()
                .map(|home| home.join(".openclaw"))
                .context("Cannot locate home directory; set sessions.state_dir"),
        }
    }
}

/// Expand a leading `~` to the home directory; other paths pass through.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(stripped) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

/// Load `explicit` when given (it must exist), else `./reclaw.toml` when
/// present, else built-in defaults.
pub fn load_config_or_default(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => load_config(path),
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            if path.exists() {
                load_config(path)
            } else {
                Ok(Config::default())
            }
        }
    }
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Validate run
    if config.run.max_parallel_jobs == 0 {
        anyhow::bail!("run.max_parallel_jobs must be >= 1");
    }
    if config.run.max_prompt_chars < 1_000 {
        anyhow::bail!("run.max_prompt_chars must be >= 1000");
    }
    if let Some(model) = &config.run.model {
        if model.trim().is_empty() {
            anyhow::bail!("run.model must not be empty when set");
        }
    }

    // Validate scheduler
    if config.scheduler.command.trim().is_empty() {
        anyhow::bail!("scheduler.command must not be empty");
    }
    if config.scheduler.poll_interval_ms == 0 {
        anyhow::bail!("scheduler.poll_interval_ms must be >= 1");
    }
    if config.scheduler.job_timeout_secs == 0 {
        anyhow::bail!("scheduler.job_timeout_secs must be >= 1");
    }
    if config.scheduler.wait_timeout_secs < config.scheduler.job_timeout_secs {
        anyhow::bail!(
            "scheduler.wait_timeout_secs ({}) must be >= scheduler.job_timeout_secs ({})",
            config.scheduler.wait_timeout_secs,
            config.scheduler.job_timeout_secs
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("reclaw.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn empty_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&write_config(&tmp, "")).unwrap();
        assert_eq!(config.run.mode, ExtractionMode::Openclaw);
        assert_eq!(config.run.max_parallel_jobs, 4);
        assert_eq!(config.run.max_prompt_chars, 110_000);
        assert_eq!(config.run.backup_mode, BackupMode::Single);
        assert_eq!(config.scheduler.command, "openclaw");
        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.scheduler.wait_timeout(), Duration::from_secs(1_900));
    }

    #[test]
    fn parses_all_sections() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&write_config(
            &tmp,
            r#"
[run]
mode = "zettelclaw"
model = "anthropic/claude-sonnet"
max_parallel_jobs = 2
backup_mode = "timestamped"
include_session_refs = false

[scheduler]
command = "/opt/openclaw/bin/openclaw"
poll_interval_ms = 500

[scheduler.env]
OPENCLAW_PROFILE = "import"

[sessions]
state_dir = "/srv/openclaw"
"#,
        ))
        .unwrap();
        assert_eq!(config.run.mode, ExtractionMode::Zettelclaw);
        assert_eq!(config.run.model.as_deref(), Some("anthropic/claude-sonnet"));
        assert_eq!(config.run.backup_mode, BackupMode::Timestamped);
        assert!(!config.run.include_session_refs);
        assert_eq!(config.scheduler.env["OPENCLAW_PROFILE"], "import");
        assert_eq!(
            config.sessions.resolved_state_dir().unwrap(),
            PathBuf::from("/srv/openclaw")
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let tmp = TempDir::new().unwrap();
        for body in [
            "[run]\nmax_parallel_jobs = 0",
            "[run]\nmax_prompt_chars = 10",
            "[run]\nmode = \"obsidian\"",
            "[scheduler]\njob_timeout_secs = 600\nwait_timeout_secs = 300",
            "[scheduler]\ncommand = \"  \"",
        ] {
            assert!(
                load_config(&write_config(&tmp, body)).is_err(),
                "accepted: {}",
                body
            );
        }
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(load_config_or_default(Some(&tmp.path().join("nope.toml"))).is_err());
    }
}
