//! Shared deterministic types for the plan loop core.
//!
//! These types define stable contracts between the round state machine, the
//! execution lanes, and the persisted run record. Serialized names are part of
//! the on-disk format and must not change.

use serde::{Deserialize, Serialize};

/// How phases are executed for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Automated lane only; an automated failure is fatal.
    Auto,
    /// Automated lane with permanent failover to the manual lane.
    Hybrid,
    /// Manual lane only.
    Manual,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Hybrid => "hybrid",
            Mode::Manual => "manual",
        }
    }

    /// Lane a fresh run starts in.
    pub fn initial_lane(self) -> Lane {
        match self {
            Mode::Auto | Mode::Hybrid => Lane::Auto,
            Mode::Manual => Lane::Manual,
        }
    }

    pub fn allows_failover(self) -> bool {
        self == Mode::Hybrid
    }
}

/// Execution strategy for a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Auto,
    Manual,
}

impl Lane {
    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Auto => "auto",
            Lane::Manual => "manual",
        }
    }
}

/// Agent interaction within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Judge,
    Rewrite,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Judge => "judge",
            Phase::Rewrite => "rewrite",
        }
    }
}

/// Lifecycle status of a run. Everything except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Passed,
    NeedsHumanTiebreaker,
    Stopped,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::NeedsHumanTiebreaker => "needs_human_tiebreaker",
            RunStatus::Stopped => "stopped",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }

    /// Completed runs (approved or capped) must not be resumed.
    pub fn is_completed(self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::NeedsHumanTiebreaker)
    }
}

/// Outcome recorded for a round.
///
/// `Failed` and `Stopped` rounds did not finish; resuming the run redoes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Passed,
    Continued,
    Failed,
    Stopped,
}

/// Structured verdict produced by the judge phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub pass: bool,
    pub problems: Vec<String>,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rewrite_instructions: Vec<String>,
}

impl JudgeResult {
    /// The loop's only success condition: `pass=true` and no problems.
    pub fn strict_pass(&self) -> bool {
        self.pass && self.problems.is_empty()
    }
}

/// Structured output produced by the rewrite phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteResult {
    pub revised_plan_markdown: String,
    #[serde(default)]
    pub applied_fixes: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn judge(pass: bool, problems: &[&str]) -> JudgeResult {
        JudgeResult {
            pass,
            problems: problems.iter().map(|p| p.to_string()).collect(),
            blocking: false,
            summary: String::new(),
            rewrite_instructions: Vec::new(),
        }
    }

    #[test]
    fn strict_pass_requires_pass_and_no_problems() {
        assert!(judge(true, &[]).strict_pass());
        assert!(!judge(true, &["x"]).strict_pass());
        assert!(!judge(false, &[]).strict_pass());
        assert!(!judge(false, &["x"]).strict_pass());
    }

    #[test]
    fn judge_result_defaults_optional_fields() {
        let parsed: JudgeResult =
            serde_json::from_str(r#"{"pass": false, "problems": ["a"]}"#).expect("parse");
        assert!(!parsed.blocking);
        assert_eq!(parsed.summary, "");
        assert!(parsed.rewrite_instructions.is_empty());
    }

    #[test]
    fn judge_result_requires_pass_and_problems() {
        assert!(serde_json::from_str::<JudgeResult>(r#"{"problems": []}"#).is_err());
        assert!(serde_json::from_str::<JudgeResult>(r#"{"pass": true}"#).is_err());
    }

    #[test]
    fn mode_selects_initial_lane() {
        assert_eq!(Mode::Auto.initial_lane(), Lane::Auto);
        assert_eq!(Mode::Hybrid.initial_lane(), Lane::Auto);
        assert_eq!(Mode::Manual.initial_lane(), Lane::Manual);
        assert!(Mode::Hybrid.allows_failover());
        assert!(!Mode::Auto.allows_failover());
    }

    #[test]
    fn run_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::NeedsHumanTiebreaker).expect("json");
        assert_eq!(json, "\"needs_human_tiebreaker\"");
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Stopped.is_completed());
        assert!(RunStatus::Passed.is_completed());
    }
}
