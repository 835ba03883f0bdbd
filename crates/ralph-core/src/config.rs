//! Coordinator configuration.
//!
//! Loaded from a `ralph.toml` file at the repository root and resolved into
//! a typed [`CoordinatorConfig`]. Validation failures here are fatal: the
//! coordinator refuses to start on an invalid worker count, a malformed
//! branch name, or an unknown agent plugin.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Default integration branch when none is configured.
pub const DEFAULT_INTEGRATION_BRANCH: &str = "ralph/integration";

/// Default coordinator state directory, relative to the repository root.
pub const DEFAULT_STATE_DIR: &str = ".ralph";

/// Substrings that identify an agent-side credit/rate-limit exhaustion.
/// Matched case-insensitively against agent stdout and stderr.
pub const DEFAULT_CREDIT_MARKERS: &[&str] = &[
    "insufficient_credit",
    "account overdue",
    "non-negative balance",
];

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Number of parallel workers. Must be greater than zero.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Branch onto which worker commits are serialized. Overridden by
    /// `quality_gates.integration_branch` when that is set.
    #[serde(default = "default_target_branch")]
    pub target_branch: String,

    /// Coordinator state directory, relative to the repository root.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub quality_gates: QualityGateConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_max_workers() -> usize {
    2
}

fn default_target_branch() -> String {
    DEFAULT_INTEGRATION_BRANCH.to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            target_branch: default_target_branch(),
            state_dir: default_state_dir(),
            quality_gates: QualityGateConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// Quality gate (validation) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityGateConfig {
    /// Master switch. When disabled, merged commits go straight to
    /// mainline sync.
    #[serde(default)]
    pub enabled: bool,

    /// Overrides `target_branch` as the integration branch.
    #[serde(default)]
    pub integration_branch: Option<String>,

    /// When set, tasks without an impact plan or impact table are blocked
    /// before dispatch.
    #[serde(default)]
    pub require_impact_table: bool,

    /// Override for the validator workspace location.
    #[serde(default)]
    pub validator_worktree_path: Option<PathBuf>,

    /// Run `clean -fdx` in the validator workspace before each plan.
    #[serde(default)]
    pub clean_before_run: bool,

    #[serde(default)]
    pub mode: ValidationMode,

    /// Accumulation window for `batch-window` mode.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Auto-heal attempts per failed plan. Zero disables the fix loop.
    #[serde(default)]
    pub max_fix_attempts: u32,

    /// Default rerun budget for checks with `retry_on_failure` and no
    /// per-check `max_reruns`.
    #[serde(default)]
    pub max_test_reruns: u32,

    /// Check id -> check definition. Iteration order (lexicographic) is the
    /// selection order for plans.
    #[serde(default)]
    pub checks: BTreeMap<String, CheckConfig>,

    /// Path prefix -> check ids to run when a changed file matches.
    #[serde(default)]
    pub rules: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,
}

fn default_batch_window_ms() -> u64 {
    2_000
}

/// How merged commits are grouped into validation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationMode {
    /// One plan per merged commit batch, FIFO.
    #[default]
    PerMerge,
    /// A newer plan evicts everything still queued.
    Coalesce,
    /// Accumulate plans for `batch_window_ms` before draining.
    BatchWindow,
}

/// What to do when a required check fails and cannot be healed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    /// Revert the plan's commits on integration and block the task.
    Revert,
    /// Block the task only.
    #[default]
    Quarantine,
    /// Pause the whole coordinator until an operator resumes it.
    Pause,
}

/// A single validation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConfig {
    /// Shell command line, run with `sh -c` in the validator workspace.
    pub command: String,
    /// Required checks abort the plan on failure; optional ones only log.
    #[serde(default)]
    pub required: bool,
    /// Per-check soft timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Rerun the check on failure before declaring it failed.
    #[serde(default)]
    pub retry_on_failure: bool,
    /// Rerun budget; falls back to `max_test_reruns` when unset.
    #[serde(default)]
    pub max_reruns: Option<u32>,
}

/// Agent plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Plugin name resolved through the agent registry. Unknown names are
    /// fatal at initialization.
    #[serde(default = "default_agent_plugin")]
    pub plugin: String,

    /// Executable for the `command` plugin.
    #[serde(default = "default_agent_command")]
    pub command: String,

    /// Flags passed on every invocation.
    #[serde(default)]
    pub default_flags: Vec<String>,

    /// Wall-clock limit per agent run.
    #[serde(default = "default_agent_timeout_ms")]
    pub timeout_ms: u64,

    /// Model identifier forwarded to the agent, when the plugin supports it.
    #[serde(default)]
    pub model: Option<String>,

    /// Stdout substring that signals task completion in addition to a zero
    /// exit code.
    #[serde(default = "default_completion_sentinel")]
    pub completion_sentinel: String,

    /// Case-insensitive substrings that identify credit exhaustion.
    #[serde(default = "default_credit_markers")]
    pub credit_markers: Vec<String>,

    /// Free-form plugin options.
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,
}

fn default_agent_plugin() -> String {
    "command".to_string()
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_completion_sentinel() -> String {
    "RALPH_DONE".to_string()
}

fn default_credit_markers() -> Vec<String> {
    DEFAULT_CREDIT_MARKERS
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            plugin: default_agent_plugin(),
            command: default_agent_command(),
            default_flags: Vec::new(),
            timeout_ms: default_agent_timeout_ms(),
            model: None,
            completion_sentinel: default_completion_sentinel(),
            credit_markers: default_credit_markers(),
            options: BTreeMap::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from `<repo_root>/ralph.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = repo_root.join("ralph.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load and parse a specific configuration file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// The effective integration branch: the quality-gate override when
    /// present, else `target_branch`.
    pub fn integration_branch(&self) -> &str {
        self.quality_gates
            .integration_branch
            .as_deref()
            .unwrap_or(&self.target_branch)
    }

    /// Validate the configuration. Errors here abort initialization.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            bail!("max_workers must be greater than zero");
        }
        validate_branch_name(&self.target_branch)?;
        if let Some(branch) = &self.quality_gates.integration_branch {
            validate_branch_name(branch)?;
        }
        if self.agent.plugin.is_empty() {
            bail!("agent.plugin must not be empty");
        }
        for (prefix, check_ids) in &self.quality_gates.rules {
            for id in check_ids {
                if !self.quality_gates.checks.contains_key(id) {
                    bail!(
                        "rule for path prefix {prefix:?} references unknown check {id:?}"
                    );
                }
            }
        }
        Ok(())
    }

    /// Rerun budget for a check, honoring the per-check override.
    pub fn max_reruns_for(&self, check: &CheckConfig) -> u32 {
        check.max_reruns.unwrap_or(self.quality_gates.max_test_reruns)
    }
}

/// Reject branch names git itself would refuse.
fn validate_branch_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.ends_with('/')
        || name.ends_with('.')
        || name.contains("..")
        || name.contains("//")
        || name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'));
    if bad {
        bail!("invalid branch name: {name:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CoordinatorConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.integration_branch(), DEFAULT_INTEGRATION_BRANCH);
    }

    #[test]
    fn integration_branch_override_wins() {
        let mut config = CoordinatorConfig::default();
        config.quality_gates.integration_branch = Some("integration/gate".to_string());
        assert_eq!(config.integration_branch(), "integration/gate");
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = CoordinatorConfig {
            max_workers: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_branch_names_are_rejected() {
        for name in ["", "a b", "x..y", "end/", "/start", "tail.", "col:on", "star*"] {
            let config = CoordinatorConfig {
                target_branch: name.to_string(),
                ..CoordinatorConfig::default()
            };
            assert!(config.validate().is_err(), "expected {name:?} to be rejected");
        }
    }

    #[test]
    fn rule_referencing_unknown_check_is_rejected() {
        let mut config = CoordinatorConfig::default();
        config
            .quality_gates
            .rules
            .insert("src/".to_string(), vec!["missing".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_full_config_file() {
        let toml_src = r#"
            max_workers = 3
            target_branch = "main"

            [quality_gates]
            enabled = true
            mode = "batch-window"
            batch_window_ms = 500
            max_fix_attempts = 1
            max_test_reruns = 2
            fallback_strategy = "revert"

            [quality_gates.checks.sanity]
            command = "cargo check"
            required = true
            timeout_ms = 120000

            [quality_gates.checks.unit]
            command = "cargo test"
            retry_on_failure = true
            max_reruns = 1

            [quality_gates.rules]
            "src/" = ["unit"]

            [agent]
            plugin = "command"
            command = "fake-agent"
            default_flags = ["-p"]
            timeout_ms = 60000
        "#;
        let config: CoordinatorConfig = toml::from_str(toml_src).expect("parse failed");
        config.validate().expect("should validate");

        assert_eq!(config.max_workers, 3);
        assert_eq!(config.quality_gates.mode, ValidationMode::BatchWindow);
        assert_eq!(config.quality_gates.fallback_strategy, FallbackStrategy::Revert);
        assert!(config.quality_gates.checks["sanity"].required);
        assert_eq!(
            config.max_reruns_for(&config.quality_gates.checks["unit"]),
            1
        );
        assert_eq!(
            config.max_reruns_for(&config.quality_gates.checks["sanity"]),
            2
        );
        assert_eq!(config.agent.command, "fake-agent");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CoordinatorConfig::load(dir.path()).expect("load failed");
        assert_eq!(config.max_workers, 2);
    }

    #[test]
    fn default_credit_markers_match_known_set() {
        let config = AgentConfig::default();
        assert!(config.credit_markers.iter().any(|m| m == "insufficient_credit"));
        assert!(config.credit_markers.iter().any(|m| m == "account overdue"));
        assert!(config.credit_markers.iter().any(|m| m == "non-negative balance"));
    }
}
