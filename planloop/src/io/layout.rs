//! Canonical on-disk layout for a plan's loop output.
//!
//! For a plan `<dir>/<stem>.md` everything lives under `<dir>/.<stem>_loop/`:
//!
//! ```text
//! .<stem>_loop/
//!   iterations/<run_id>/round_NNNN/...
//!   final/approved_plan.md
//!   final/final_report.md
//!   state/loop_status.json
//!   state/objective_snapshot.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::types::Phase;

/// All canonical paths derived from one plan file.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub plan_path: PathBuf,
    /// Directory holding the plan; agents run here.
    pub workdir: PathBuf,
    pub base_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub final_dir: PathBuf,
    pub state_dir: PathBuf,
    pub state_path: PathBuf,
    pub objective_path: PathBuf,
    /// Where the built-in prompts and schemas are written when no assets
    /// directory is configured.
    pub assets_dir: PathBuf,
    pub approved_plan_path: PathBuf,
    pub final_report_path: PathBuf,
}

impl RunLayout {
    /// Derive the layout for `plan_path`. The file itself need not exist.
    pub fn for_plan(plan_path: &Path) -> Result<Self> {
        let plan_path = absolute(plan_path)?;
        let stem = plan_path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("plan path has no file name: {}", plan_path.display()))?;
        let workdir = plan_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("plan path has no parent: {}", plan_path.display()))?;

        let base_dir = workdir.join(format!(".{stem}_loop"));
        let final_dir = base_dir.join("final");
        let state_dir = base_dir.join("state");
        Ok(Self {
            iterations_dir: base_dir.join("iterations"),
            state_path: state_dir.join("loop_status.json"),
            objective_path: state_dir.join("objective_snapshot.json"),
            assets_dir: state_dir.join("assets"),
            approved_plan_path: final_dir.join("approved_plan.md"),
            final_report_path: final_dir.join("final_report.md"),
            plan_path,
            workdir,
            base_dir,
            final_dir,
            state_dir,
        })
    }

    /// Create the `iterations/`, `final/` and `state/` directories.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.iterations_dir, &self.final_dir, &self.state_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.iterations_dir.join(run_id)
    }
}

/// New run id from the current UTC time (`run_YYYYMMDD_HHMMSS`).
pub fn new_run_id() -> String {
    chrono::Utc::now().format("run_%Y%m%d_%H%M%S").to_string()
}

/// Files written for one round.
#[derive(Debug, Clone)]
pub struct RoundPaths {
    pub round: u32,
    pub dir: PathBuf,
    pub input_plan_path: PathBuf,
    pub revised_plan_path: PathBuf,
    pub summary_path: PathBuf,
}

impl RoundPaths {
    pub fn new(run_dir: &Path, round: u32) -> Self {
        let dir = run_dir.join(round_dir_name(round));
        Self {
            round,
            input_plan_path: dir.join("input_plan.md"),
            revised_plan_path: dir.join("revised_plan.md"),
            summary_path: dir.join("round_summary.json"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create round dir {}", self.dir.display()))
    }

    pub fn phase(&self, phase: Phase) -> PhasePaths {
        PhasePaths::new(&self.dir, phase)
    }
}

pub fn round_dir_name(round: u32) -> String {
    format!("round_{round:04}")
}

/// Per-phase artifacts inside a round directory.
#[derive(Debug, Clone)]
pub struct PhasePaths {
    pub prompt_path: PathBuf,
    pub raw_output_path: PathBuf,
    pub repair_prompt_path: PathBuf,
    pub repair_raw_output_path: PathBuf,
    pub result_path: PathBuf,
    pub manual_prompt_path: PathBuf,
    pub manual_instructions_path: PathBuf,
    pub manual_output_path: PathBuf,
}

impl PhasePaths {
    pub fn new(round_dir: &Path, phase: Phase) -> Self {
        let name = phase.as_str();
        Self {
            prompt_path: round_dir.join(format!("{name}_prompt.md")),
            raw_output_path: round_dir.join(format!("{name}_raw_output.txt")),
            repair_prompt_path: round_dir.join(format!("{name}_repair_prompt.md")),
            repair_raw_output_path: round_dir.join(format!("{name}_repair_raw_output.txt")),
            result_path: round_dir.join(format!("{name}_result.json")),
            manual_prompt_path: round_dir.join(format!("manual_{name}_prompt.md")),
            manual_instructions_path: round_dir.join(format!("manual_{name}_instructions.txt")),
            manual_output_path: round_dir.join(format!("manual_{name}_output.txt")),
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("resolve current directory")?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_stable() {
        let layout = RunLayout::for_plan(Path::new("/work/docs/migration.md")).expect("layout");
        assert_eq!(layout.workdir, Path::new("/work/docs"));
        assert_eq!(layout.base_dir, Path::new("/work/docs/.migration_loop"));
        assert!(layout.state_path.ends_with(".migration_loop/state/loop_status.json"));
        assert!(
            layout
                .objective_path
                .ends_with(".migration_loop/state/objective_snapshot.json")
        );
        assert!(layout.approved_plan_path.ends_with("final/approved_plan.md"));
        assert!(layout.final_report_path.ends_with("final/final_report.md"));
        assert_eq!(
            layout.run_dir("run_20260101_000000"),
            Path::new("/work/docs/.migration_loop/iterations/run_20260101_000000")
        );
    }

    #[test]
    fn ensure_creates_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = RunLayout::for_plan(&temp.path().join("plan.md")).expect("layout");
        layout.ensure().expect("ensure");
        assert!(layout.iterations_dir.is_dir());
        assert!(layout.final_dir.is_dir());
        assert!(layout.state_dir.is_dir());
        // Idempotent.
        layout.ensure().expect("ensure again");
    }

    #[test]
    fn round_and_phase_paths() {
        let round = RoundPaths::new(Path::new("/r"), 7);
        assert_eq!(round.dir, Path::new("/r/round_0007"));
        assert!(round.summary_path.ends_with("round_0007/round_summary.json"));

        let judge = round.phase(Phase::Judge);
        assert!(judge.prompt_path.ends_with("judge_prompt.md"));
        assert!(judge.repair_raw_output_path.ends_with("judge_repair_raw_output.txt"));
        let rewrite = round.phase(Phase::Rewrite);
        assert!(rewrite.manual_output_path.ends_with("manual_rewrite_output.txt"));
        assert!(
            rewrite
                .manual_instructions_path
                .ends_with("manual_rewrite_instructions.txt")
        );
    }

    #[test]
    fn run_id_format() {
        let id = new_run_id();
        assert!(id.starts_with("run_"), "{id}");
        assert_eq!(id.len(), "run_20260101_000000".len());
    }
}
