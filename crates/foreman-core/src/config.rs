//! Executor configuration (TOML).
//!
//! Everything tunable is named here rather than buried as a heuristic:
//! timeouts, batch sizes, retention thresholds, retry counts, and the
//! code-review confidence threshold. [`ExecutorConfig::validate`] runs at
//! startup and failures are fatal, with one exception: an invalid
//! [`RetentionConfig`] only disables the event-cleanup loop (loudly).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Event retention policy for the cleanup loop.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub cleanup_enabled: bool,
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Critical-severity events are retained longer than this many days.
    #[serde(default = "default_retention_critical_days")]
    pub retention_critical_days: u32,
    #[serde(default = "default_per_issue_limit")]
    pub per_issue_limit_events: u64,
    #[serde(default = "default_global_limit")]
    pub global_limit_events: u64,
    #[serde(default = "default_batch_size")]
    pub cleanup_batch_size: u64,
    #[serde(default)]
    pub cleanup_vacuum: bool,
}

fn default_true() -> bool {
    true
}
fn default_cleanup_interval_hours() -> u64 {
    6
}
fn default_retention_days() -> u32 {
    30
}
fn default_retention_critical_days() -> u32 {
    90
}
fn default_per_issue_limit() -> u64 {
    1_000
}
fn default_global_limit() -> u64 {
    100_000
}
fn default_batch_size() -> u64 {
    500
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            cleanup_enabled: true,
            cleanup_interval_hours: default_cleanup_interval_hours(),
            retention_days: default_retention_days(),
            retention_critical_days: default_retention_critical_days(),
            per_issue_limit_events: default_per_issue_limit(),
            global_limit_events: default_global_limit(),
            cleanup_batch_size: default_batch_size(),
            cleanup_vacuum: false,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.cleanup_interval_hours == 0 {
            return Err(AppError::InvalidConfig("cleanup_interval_hours must be > 0".into()));
        }
        if self.retention_days == 0 {
            return Err(AppError::InvalidConfig("retention_days must be > 0".into()));
        }
        if self.retention_critical_days < self.retention_days {
            return Err(AppError::InvalidConfig(
                "retention_critical_days must be >= retention_days".into(),
            ));
        }
        if self.per_issue_limit_events == 0 || self.global_limit_events == 0 {
            return Err(AppError::InvalidConfig("event limits must be > 0".into()));
        }
        if self.cleanup_batch_size == 0 {
            return Err(AppError::InvalidConfig("cleanup_batch_size must be > 0".into()));
        }
        Ok(())
    }
}

/// How to launch the external coding agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Agent emits line-delimited JSON events on stdout.
    #[serde(default = "default_true")]
    pub streaming_json: bool,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
    /// Max silence (no stdout) before the watchdog kills the agent.
    #[serde(default = "default_agent_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_agent_program() -> String {
    "claude".to_string()
}
fn default_agent_timeout() -> u64 {
    3_600
}
fn default_agent_idle_timeout() -> u64 {
    300
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            args: Vec::new(),
            streaming_json: true,
            timeout_secs: default_agent_timeout(),
            idle_timeout_secs: default_agent_idle_timeout(),
        }
    }
}

/// One verification gate to run after an agent finishes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateCommandConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Quality-gate settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_gates_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_gate_commands")]
    pub commands: Vec<GateCommandConfig>,
}

fn default_gates_timeout() -> u64 {
    300
}

fn default_gate_commands() -> Vec<GateCommandConfig> {
    vec![
        GateCommandConfig {
            name: "test".into(),
            program: "cargo".into(),
            args: vec!["test".into()],
        },
        GateCommandConfig {
            name: "lint".into(),
            program: "cargo".into(),
            args: vec!["clippy".into(), "--".into(), "-D".into(), "warnings".into()],
        },
        GateCommandConfig {
            name: "build".into(),
            program: "cargo".into(),
            args: vec!["build".into()],
        },
    ]
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_gates_timeout(),
            commands: default_gate_commands(),
        }
    }
}

/// Top-level executor configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Stable identifier for this executor instance. Generated when empty.
    #[serde(default)]
    pub executor_id: String,
    /// Repository root quality gates and commits operate on.
    pub repo_root: PathBuf,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub gates: GatesConfig,
    #[serde(default = "default_true")]
    pub ai_enabled: bool,
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    /// Co-author trailer appended to auto-commits.
    #[serde(default = "default_co_author")]
    pub co_author: String,
    /// Below this confidence, the code-review decision forces review.
    #[serde(default = "default_review_confidence")]
    pub review_confidence_threshold: f64,
    /// Retries granted before incomplete work escalates to a human.
    #[serde(default = "default_incomplete_retries")]
    pub max_incomplete_retries: u32,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// Claims without a heartbeat for this long are considered abandoned.
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_stale_check_secs")]
    pub stale_check_interval_secs: u64,
    /// How many failed sandboxes to keep around for inspection.
    #[serde(default = "default_failed_sandbox_retention")]
    pub failed_sandbox_retention: u32,
    #[serde(default = "default_stopped_instance_age_days")]
    pub stopped_instance_max_age_days: u32,
    #[serde(default = "default_stopped_instance_keep")]
    pub stopped_instance_keep: u32,
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_co_author() -> String {
    "Foreman Executor <foreman@localhost>".to_string()
}
fn default_review_confidence() -> f64 {
    0.70
}
fn default_incomplete_retries() -> u32 {
    1
}
fn default_heartbeat_secs() -> u64 {
    15
}
fn default_stale_threshold_secs() -> u64 {
    300
}
fn default_stale_check_secs() -> u64 {
    60
}
fn default_failed_sandbox_retention() -> u32 {
    5
}
fn default_stopped_instance_age_days() -> u32 {
    7
}
fn default_stopped_instance_keep() -> u32 {
    10
}

impl ExecutorConfig {
    /// Load from a TOML file, generating an executor id when absent.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config: ExecutorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        if config.executor_id.is_empty() {
            config.executor_id = generate_executor_id();
        }
        Ok(config)
    }

    /// Startup validation. Retention is validated separately by the
    /// event-cleanup loop so a bad retention block degrades instead of
    /// aborting the executor.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.agent.program.trim().is_empty() {
            return Err(AppError::InvalidConfig("agent.program must not be empty".into()));
        }
        if self.agent.timeout_secs == 0 {
            return Err(AppError::InvalidConfig("agent.timeout_secs must be > 0".into()));
        }
        if self.agent.idle_timeout_secs == 0 {
            return Err(AppError::InvalidConfig("agent.idle_timeout_secs must be > 0".into()));
        }
        if self.gates.timeout_secs == 0 {
            return Err(AppError::InvalidConfig("gates.timeout_secs must be > 0".into()));
        }
        if !(self.review_confidence_threshold > 0.0 && self.review_confidence_threshold <= 1.0) {
            return Err(AppError::InvalidConfig(
                "review_confidence_threshold must be in (0, 1]".into(),
            ));
        }
        if self.heartbeat_interval_secs == 0 || self.stale_threshold_secs == 0 {
            return Err(AppError::InvalidConfig("heartbeat intervals must be > 0".into()));
        }
        if self.stale_threshold_secs <= self.heartbeat_interval_secs {
            return Err(AppError::InvalidConfig(
                "stale_threshold_secs must exceed heartbeat_interval_secs".into(),
            ));
        }
        Ok(())
    }
}

pub fn generate_executor_id() -> String {
    format!("foreman-{}", ulid::Ulid::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ExecutorConfig {
        ExecutorConfig {
            executor_id: "foreman-test".into(),
            repo_root: PathBuf::from("/tmp/repo"),
            agent: AgentConfig::default(),
            gates: GatesConfig::default(),
            ai_enabled: true,
            auto_commit: true,
            co_author: default_co_author(),
            review_confidence_threshold: 0.70,
            max_incomplete_retries: 1,
            heartbeat_interval_secs: 15,
            stale_threshold_secs: 300,
            stale_check_interval_secs: 60,
            failed_sandbox_retention: 5,
            stopped_instance_max_age_days: 7,
            stopped_instance_keep: 10,
            retention: RetentionConfig::default(),
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(valid_config().validate().is_ok());
        assert!(RetentionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_review_confidence_bounds() {
        let mut config = valid_config();
        config.review_confidence_threshold = 0.0;
        assert!(config.validate().is_err());
        config.review_confidence_threshold = 1.5;
        assert!(config.validate().is_err());
        config.review_confidence_threshold = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stale_threshold_must_exceed_heartbeat() {
        let mut config = valid_config();
        config.stale_threshold_secs = config.heartbeat_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_rejects_zero_batch() {
        let retention = RetentionConfig {
            cleanup_batch_size: 0,
            ..Default::default()
        };
        assert!(retention.validate().is_err());
    }

    #[test]
    fn test_retention_critical_must_cover_base_window() {
        let retention = RetentionConfig {
            retention_days: 30,
            retention_critical_days: 7,
            ..Default::default()
        };
        assert!(retention.validate().is_err());
    }

    #[test]
    fn test_load_minimal_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        std::fs::write(&path, "repo_root = \"/tmp/repo\"\n").unwrap();
        let config = ExecutorConfig::load(&path).unwrap();
        assert!(config.executor_id.starts_with("foreman-"));
        assert_eq!(config.gates.timeout_secs, 300);
        assert_eq!(config.agent.idle_timeout_secs, 300);
        assert_eq!(config.review_confidence_threshold, 0.70);
        assert_eq!(config.gates.commands.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_preserves_explicit_executor_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        std::fs::write(&path, "repo_root = \"/r\"\nexecutor_id = \"exec-a\"\n").unwrap();
        let config = ExecutorConfig::load(&path).unwrap();
        assert_eq!(config.executor_id, "exec-a");
    }
}
