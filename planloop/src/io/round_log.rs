//! Round artifacts under `iterations/<run_id>/round_NNNN/`.
//!
//! A round that passed or continued is never modified again. A failed or
//! stopped round is redone on resume, which replaces its artifacts and summary.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{Lane, RoundStatus};

/// Summary persisted as `round_summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u32,
    pub lane: Lane,
    pub judge_pass: bool,
    pub strict_pass: bool,
    pub problem_count: usize,
    pub blocking: bool,
    pub judge_summary: String,
    pub judge_parse_mode: String,
    pub status: RoundStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_parse_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_summary: Option<String>,
    /// Why a failed round ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RoundSummary {
    /// Summary of a round whose judge phase has not completed yet.
    pub fn pending(round: u32, lane: Lane) -> Self {
        Self {
            round,
            lane,
            judge_pass: false,
            strict_pass: false,
            problem_count: 0,
            blocking: false,
            judge_summary: String::new(),
            judge_parse_mode: "none".to_string(),
            status: RoundStatus::Failed,
            rewrite_parse_mode: None,
            rewrite_summary: None,
            error: None,
        }
    }
}

pub fn write_round_summary(path: &Path, summary: &RoundSummary) -> Result<()> {
    debug!(round = summary.round, status = ?summary.status, "writing round summary");
    write_json(path, summary)
}

/// Round summaries of `run_dir` in round order.
///
/// Missing or unreadable summaries are skipped with a warning.
pub fn collect_round_summaries(run_dir: &Path) -> Result<Vec<RoundSummary>> {
    if !run_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut round_dirs = Vec::new();
    for entry in
        fs::read_dir(run_dir).with_context(|| format!("read run dir {}", run_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read entry in {}", run_dir.display()))?;
        let name = entry.file_name();
        if entry.path().is_dir() && name.to_string_lossy().starts_with("round_") {
            round_dirs.push(entry.path());
        }
    }
    round_dirs.sort();

    let mut summaries = Vec::new();
    for dir in round_dirs {
        let path = dir.join("round_summary.json");
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(path = %path.display(), err = %err, "skipping round without summary");
                continue;
            }
        };
        match serde_json::from_str::<RoundSummary>(&contents) {
            Ok(summary) => summaries.push(summary),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "skipping unreadable round summary");
            }
        }
    }
    Ok(summaries)
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_text(path, &buf)
}
