//! Loop configuration loaded from an optional TOML file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::Mode;

/// Loop configuration (TOML).
///
/// Every field is optional in the file; CLI flags override file values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Execution mode for new runs.
    pub mode: Mode,

    /// Round cap for new runs.
    pub max_rounds: u32,

    /// Disable the round cap entirely.
    pub no_cap: bool,

    /// Model passed to the agent as `--model`.
    pub model: Option<String>,

    /// Agent executable and leading arguments.
    pub agent_command: Vec<String>,

    /// Wall-clock limit for one agent invocation.
    pub agent_timeout_secs: u64,

    /// Truncate agent stdout/stderr beyond this many bytes.
    pub agent_output_limit_bytes: usize,

    pub manual_poll_interval_ms: u64,

    /// Prompts above this size drop the fix history, then truncate.
    pub prompt_budget_bytes: usize,

    /// Recent fix-history entries shown in prompts.
    pub fix_history_prompt_items: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Hybrid,
            max_rounds: 10,
            no_cap: false,
            model: None,
            agent_command: ["codex", "exec", "--ephemeral", "--skip-git-repo-check"]
                .map(String::from)
                .to_vec(),
            agent_timeout_secs: 20 * 60,
            agent_output_limit_bytes: 1_000_000,
            manual_poll_interval_ms: 3_000,
            prompt_budget_bytes: 400_000,
            fix_history_prompt_items: 8,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 && !self.no_cap {
            return Err(anyhow!("max_rounds must be > 0 (use no_cap to disable the cap)"));
        }
        if self.agent_command.is_empty() || self.agent_command[0].trim().is_empty() {
            return Err(anyhow!("agent_command must be a non-empty array"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if self.manual_poll_interval_ms == 0 {
            return Err(anyhow!("manual_poll_interval_ms must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(anyhow!("model must not be blank"));
        }
        Ok(())
    }

    /// Round cap for a new run, `None` when uncapped.
    pub fn round_cap(&self) -> Option<u32> {
        (!self.no_cap).then_some(self.max_rounds)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.manual_poll_interval_ms)
    }
}

/// Load config from a TOML file, or defaults when `path` is `None`.
///
/// An explicitly named file must exist.
pub fn load_config(path: Option<&Path>) -> Result<LoopConfig> {
    let Some(path) = path else {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    };
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
