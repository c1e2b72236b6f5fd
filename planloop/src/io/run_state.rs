//! Persisted run record (`state/loop_status.json`).
//!
//! The run state is the single source of truth for a run: the loop rewrites it
//! after every state-affecting event so a killed process can be resumed. An
//! external actor may set `stop_requested` in the file at any time.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{JudgeResult, Lane, Mode, RunStatus};

/// Persisted bookkeeping for one run of the loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub run_id: String,
    pub run_dir: PathBuf,
    /// Plan the run started from.
    pub input_plan_path: PathBuf,
    /// Rounds completed so far.
    pub round: u32,
    pub mode: Mode,
    pub current_lane: Lane,
    /// Round cap; `None` disables it.
    #[serde(default)]
    pub max_rounds: Option<u32>,
    pub status: RunStatus,
    /// Plan the next round judges.
    pub current_plan_path: PathBuf,
    #[serde(default)]
    pub approved_plan_path: Option<PathBuf>,
    /// Most recent applied fixes, oldest first.
    #[serde(default)]
    pub fix_history: Vec<String>,
    #[serde(default)]
    pub last_result: Option<JudgeResult>,
    #[serde(default)]
    pub stop_requested: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: String,
    pub last_updated_at: String,
}

impl RunState {
    /// Fresh state for round zero.
    pub fn new(
        run_id: String,
        run_dir: PathBuf,
        plan_path: PathBuf,
        mode: Mode,
        max_rounds: Option<u32>,
    ) -> Self {
        let now = now_rfc3339();
        Self {
            run_id,
            run_dir,
            input_plan_path: plan_path.clone(),
            round: 0,
            mode,
            current_lane: mode.initial_lane(),
            max_rounds,
            status: RunStatus::Running,
            current_plan_path: plan_path,
            approved_plan_path: None,
            fix_history: Vec::new(),
            last_result: None,
            stop_requested: false,
            error: None,
            started_at: now.clone(),
            last_updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated_at = now_rfc3339();
    }
}

/// Current UTC time as RFC 3339 with a `Z` suffix and second precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Load run state from disk.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = %state.run_id, round = state.round, status = ?state.status, "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_id = %state.run_id, round = state.round, status = ?state.status, "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Read only the `stop_requested` flag, tolerating a missing or partial file.
///
/// Any JSON object is accepted so a human can request a stop by hand-editing
/// the file without reproducing every field.
pub fn read_stop_requested(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };
    match serde_json::from_str::<serde_json::Value>(&contents) {
        Ok(value) => value
            .get("stop_requested")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable run state while checking stop flag");
            false
        }
    }
}

/// Handle on the persisted run state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<RunState> {
        load_run_state(&self.path)
    }

    /// Stamp and persist `state`.
    ///
    /// A stop flag already set on disk by another process is carried into
    /// `state` first, so a save never clears a pending stop request.
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        if !state.stop_requested && self.stop_requested() {
            debug!("carrying external stop request into saved state");
            state.stop_requested = true;
        }
        state.touch();
        write_run_state(&self.path, state)
    }

    /// Persist `state` exactly as given, dropping any on-disk stop request.
    pub fn overwrite(&self, state: &mut RunState) -> Result<()> {
        state.touch();
        write_run_state(&self.path, state)
    }

    pub fn stop_requested(&self) -> bool {
        read_stop_requested(&self.path)
    }

    /// Set `stop_requested=true` in the persisted state.
    pub fn request_stop(&self) -> Result<RunState> {
        let mut state = self.load()?;
        state.stop_requested = true;
        self.save(&mut state)?;
        Ok(state)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp run state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run state {}", path.display()))?;
    Ok(())
}
