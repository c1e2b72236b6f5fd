//! Round state machine: the sequential judge → rewrite loop.
//!
//! A run starts fresh ([`start_run`]) or from persisted state
//! ([`resume_run`]); [`drive`] then executes rounds until the plan strictly
//! passes, the round cap is reached, the run is cancelled, or an error occurs.
//! Every terminal path persists its status and renders the final report.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument, warn};

use crate::core::history::{append_fixes, recent};
use crate::core::objective::ObjectiveSnapshot;
use crate::core::types::{JudgeResult, Mode, Phase, RewriteResult, RoundStatus, RunStatus};
use crate::exit_codes;
use crate::io::agent::Agent;
use crate::io::assets::Assets;
use crate::io::cancel::{CancelToken, Halt, halt_of};
use crate::io::config::LoopConfig;
use crate::io::layout::{RoundPaths, RunLayout, new_run_id};
use crate::io::manual::ManualNotice;
use crate::io::prompt::{PromptBuilder, PromptContext};
use crate::io::round_log::{RoundSummary, write_json, write_round_summary, write_text};
use crate::io::run_state::{RunState, StateStore};
use crate::lane::{LaneSettings, PhaseOutput, PhaseRequest, PhaseRunner};
use crate::report::write_report;

/// Progress notifications for the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    Started {
        run_id: String,
        run_dir: PathBuf,
        mode: Mode,
        max_rounds: Option<u32>,
        resumed: bool,
    },
    PhaseStarted {
        round: u32,
        phase: Phase,
    },
    PhaseCompleted {
        round: u32,
        phase: Phase,
        provenance: String,
    },
    Fallback {
        phase: Phase,
        reason: String,
    },
    Manual {
        phase: Phase,
        notice: ManualNotice,
    },
    RoundFinished {
        round: u32,
        status: RoundStatus,
        problem_count: usize,
    },
    Finished(LoopOutcome),
}

/// How a driven run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub status: RunStatus,
    pub exit_code: i32,
    pub rounds_completed: u32,
    pub error: Option<String>,
    pub report_path: PathBuf,
    pub approved_plan_path: Option<PathBuf>,
}

/// Everything a run needs besides its state.
pub struct LoopContext<'a> {
    pub layout: &'a RunLayout,
    pub assets: &'a Assets,
    pub config: &'a LoopConfig,
    pub agent: &'a dyn Agent,
    pub store: &'a StateStore,
    pub cancel: &'a CancelToken,
    pub on_event: &'a dyn Fn(&LoopEvent),
}

/// Create a fresh run for `layout.plan_path`.
///
/// Writes the objective snapshot (to `state/` and the run directory) and the
/// initial run state. A previous run's state file is replaced.
#[instrument(skip_all, fields(plan = %layout.plan_path.display(), mode = mode.as_str()))]
pub fn start_run(
    layout: &RunLayout,
    store: &StateStore,
    mode: Mode,
    max_rounds: Option<u32>,
) -> Result<(RunState, ObjectiveSnapshot)> {
    if !layout.plan_path.is_file() {
        bail!("plan file not found: {}", layout.plan_path.display());
    }
    layout.ensure()?;

    let (run_id, run_dir) = unique_run_dir(layout)?;
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("create run dir {}", run_dir.display()))?;

    let plan = read_plan(&layout.plan_path)?;
    let snapshot = ObjectiveSnapshot::from_plan(&plan);
    write_json(&layout.objective_path, &snapshot)?;
    write_json(&run_dir.join("objective_snapshot.json"), &snapshot)?;

    let mut state = RunState::new(
        run_id,
        run_dir,
        layout.plan_path.clone(),
        mode,
        max_rounds,
    );
    store.overwrite(&mut state)?;
    info!(run_id = %state.run_id, "run started");
    Ok((state, snapshot))
}

/// Reload a stopped, failed or interrupted run.
///
/// Completed runs (`passed`, `needs_human_tiebreaker`) cannot be resumed.
/// Clears the stop request and the previous error.
#[instrument(skip_all, fields(plan = %layout.plan_path.display()))]
pub fn resume_run(layout: &RunLayout, store: &StateStore) -> Result<(RunState, ObjectiveSnapshot)> {
    if !store.exists() {
        bail!(
            "cannot resume: missing run state {}",
            store.path().display()
        );
    }
    let mut state = store.load().context("cannot resume: invalid run state")?;
    if state.status.is_completed() {
        bail!(
            "cannot resume a completed run (status {}); start a new run instead",
            state.status.as_str()
        );
    }
    if !state.run_dir.is_dir() {
        bail!("cannot resume: run dir not found: {}", state.run_dir.display());
    }
    if !state.current_plan_path.is_file() {
        bail!(
            "cannot resume: current plan not found: {}",
            state.current_plan_path.display()
        );
    }

    let snapshot = match load_snapshot(&layout.objective_path) {
        Some(snapshot) => snapshot,
        None => {
            warn!("objective snapshot missing or unreadable, rebuilding from current plan");
            let snapshot = ObjectiveSnapshot::from_plan(&read_plan(&state.current_plan_path)?);
            write_json(&layout.objective_path, &snapshot)?;
            snapshot
        }
    };

    state.status = RunStatus::Running;
    state.stop_requested = false;
    state.error = None;
    store.overwrite(&mut state)?;
    info!(run_id = %state.run_id, round = state.round, "run resumed");
    Ok((state, snapshot))
}

/// Run rounds until a terminal status, persist it, and render the report.
///
/// Errors inside the loop become the `error` status; only failures to persist
/// the terminal state or write the report are returned as `Err`.
pub fn drive(
    ctx: &LoopContext<'_>,
    state: &mut RunState,
    snapshot: &ObjectiveSnapshot,
    resumed: bool,
) -> Result<LoopOutcome> {
    (ctx.on_event)(&LoopEvent::Started {
        run_id: state.run_id.clone(),
        run_dir: state.run_dir.clone(),
        mode: state.mode,
        max_rounds: state.max_rounds,
        resumed,
    });

    let (status, exit_code, error) = match run_loop(ctx, state, snapshot) {
        Ok(status) => (status, exit_codes::OK, None),
        Err(err) => match halt_of(&err) {
            Some(Halt::Stop) => (RunStatus::Stopped, exit_codes::STOPPED, None),
            Some(Halt::Interrupt) => (RunStatus::Stopped, exit_codes::INTERRUPTED, None),
            None => {
                warn!(err = %format!("{err:#}"), "run failed");
                (RunStatus::Error, exit_codes::ERROR, Some(format!("{err:#}")))
            }
        },
    };

    state.status = status;
    state.error = error.clone();
    ctx.store.save(state)?;
    let report_path = write_report(ctx.layout, state)?;
    info!(status = status.as_str(), rounds = state.round, "run finished");

    let outcome = LoopOutcome {
        status,
        exit_code,
        rounds_completed: state.round,
        error,
        report_path,
        approved_plan_path: state.approved_plan_path.clone(),
    };
    (ctx.on_event)(&LoopEvent::Finished(outcome.clone()));
    Ok(outcome)
}

/// Execute rounds; returns `Passed` or `NeedsHumanTiebreaker`.
fn run_loop(
    ctx: &LoopContext<'_>,
    state: &mut RunState,
    snapshot: &ObjectiveSnapshot,
) -> Result<RunStatus> {
    let prompts = PromptBuilder::new(ctx.config.prompt_budget_bytes)?;
    let runner = PhaseRunner {
        agent: ctx.agent,
        store: ctx.store,
        cancel: ctx.cancel,
        settings: LaneSettings {
            agent_timeout: ctx.config.agent_timeout(),
            agent_output_limit_bytes: ctx.config.agent_output_limit_bytes,
            poll_interval: ctx.config.poll_interval(),
        },
        on_event: ctx.on_event,
    };

    loop {
        ctx.cancel.check()?;

        if let Some(cap) = state.max_rounds
            && state.round >= cap
        {
            info!(cap, "round cap reached without strict pass");
            state.status = RunStatus::NeedsHumanTiebreaker;
            ctx.store.save(state)?;
            return Ok(RunStatus::NeedsHumanTiebreaker);
        }

        if run_round(ctx, &prompts, &runner, state, snapshot)? == RoundStatus::Passed {
            return Ok(RunStatus::Passed);
        }
    }
}

/// Run one round. A round that ends in an error or cancellation still leaves
/// a `failed` or `stopped` summary behind.
#[instrument(skip_all, fields(round = state.round + 1))]
fn run_round(
    ctx: &LoopContext<'_>,
    prompts: &PromptBuilder,
    runner: &PhaseRunner<'_>,
    state: &mut RunState,
    snapshot: &ObjectiveSnapshot,
) -> Result<RoundStatus> {
    let round = state.round + 1;
    let paths = RoundPaths::new(&state.run_dir, round);
    paths.create()?;

    let mut summary = RoundSummary::pending(round, state.current_lane);
    let err = match play_round(ctx, prompts, runner, state, snapshot, &paths, &mut summary) {
        Ok(status) => return Ok(status),
        Err(err) => err,
    };

    summary.lane = state.current_lane;
    if halt_of(&err).is_some() {
        summary.status = RoundStatus::Stopped;
    } else {
        summary.status = RoundStatus::Failed;
        summary.error = Some(format!("{err:#}"));
    }
    if let Err(write_err) = write_round_summary(&paths.summary_path, &summary) {
        warn!(err = %format!("{write_err:#}"), "could not record unfinished round");
    }
    Err(err)
}

fn play_round(
    ctx: &LoopContext<'_>,
    prompts: &PromptBuilder,
    runner: &PhaseRunner<'_>,
    state: &mut RunState,
    snapshot: &ObjectiveSnapshot,
    paths: &RoundPaths,
    summary: &mut RoundSummary,
) -> Result<RoundStatus> {
    let round = summary.round;
    let plan_path = state.current_plan_path.clone();
    let plan = read_plan(&plan_path)?;
    write_text(&paths.input_plan_path, &plan)?;

    let fixes = recent(&state.fix_history, ctx.config.fix_history_prompt_items).to_vec();
    let prompt_ctx = PromptContext {
        objective_header: &ctx.assets.objective_header,
        snapshot,
        recent_fixes: &fixes,
        plan: &plan,
    };

    let judge_prompt = prompts.judge(&prompt_ctx, &ctx.assets.judge_rubric)?;
    let judge: PhaseOutput<JudgeResult> =
        run_phase(ctx, runner, state, round, Phase::Judge, &judge_prompt, paths)?;
    let verdict = judge.result;
    let strict_pass = verdict.strict_pass();
    info!(
        pass = verdict.pass,
        problems = verdict.problems.len(),
        strict_pass,
        "judge verdict"
    );

    summary.lane = state.current_lane;
    summary.judge_pass = verdict.pass;
    summary.strict_pass = strict_pass;
    summary.problem_count = verdict.problems.len();
    summary.blocking = verdict.blocking;
    summary.judge_summary = verdict.summary.clone();
    summary.judge_parse_mode = judge.provenance;

    if strict_pass {
        write_text(&ctx.layout.approved_plan_path, &plan)?;
        summary.status = RoundStatus::Passed;
        write_round_summary(&paths.summary_path, summary)?;

        state.round = round;
        state.status = RunStatus::Passed;
        state.approved_plan_path = Some(ctx.layout.approved_plan_path.clone());
        state.last_result = Some(verdict);
        ctx.store.save(state)?;
        finish_round(ctx, summary);
        return Ok(RoundStatus::Passed);
    }

    let rewrite_prompt = prompts.rewrite(&prompt_ctx, &ctx.assets.rewrite_prompt, &verdict)?;
    let rewrite: PhaseOutput<RewriteResult> = run_phase(
        ctx,
        runner,
        state,
        round,
        Phase::Rewrite,
        &rewrite_prompt,
        paths,
    )?;
    summary.rewrite_parse_mode = Some(rewrite.provenance);
    summary.rewrite_summary = Some(rewrite.result.summary);

    let revised = rewrite.result.revised_plan_markdown.trim();
    if revised.is_empty() {
        return Err(anyhow!(
            "round {round}: rewrite result has empty revised_plan_markdown"
        ));
    }
    write_text(&paths.revised_plan_path, &format!("{revised}\n"))?;

    summary.lane = state.current_lane;
    summary.status = RoundStatus::Continued;
    write_round_summary(&paths.summary_path, summary)?;

    append_fixes(&mut state.fix_history, rewrite.result.applied_fixes);
    state.round = round;
    state.current_plan_path = paths.revised_plan_path.clone();
    state.last_result = Some(verdict);
    ctx.store.save(state)?;
    finish_round(ctx, summary);
    Ok(RoundStatus::Continued)
}

fn run_phase<T: serde::de::DeserializeOwned>(
    ctx: &LoopContext<'_>,
    runner: &PhaseRunner<'_>,
    state: &mut RunState,
    round: u32,
    phase: Phase,
    prompt: &str,
    paths: &RoundPaths,
) -> Result<PhaseOutput<T>> {
    (ctx.on_event)(&LoopEvent::PhaseStarted { round, phase });
    let phase_paths = paths.phase(phase);
    let schema = ctx.assets.schema(phase);
    let output = runner
        .run_phase::<T>(
            state,
            &PhaseRequest {
                round,
                phase,
                prompt,
                schema,
                paths: &phase_paths,
                workdir: &ctx.layout.workdir,
            },
        )
        .with_context(|| format!("round {round} {}", phase.as_str()))?;
    (ctx.on_event)(&LoopEvent::PhaseCompleted {
        round,
        phase,
        provenance: output.provenance.clone(),
    });
    Ok(output)
}

fn finish_round(ctx: &LoopContext<'_>, summary: &RoundSummary) {
    (ctx.on_event)(&LoopEvent::RoundFinished {
        round: summary.round,
        status: summary.status,
        problem_count: summary.problem_count,
    });
}

fn read_plan(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))
}

fn load_snapshot(path: &Path) -> Option<ObjectiveSnapshot> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Run id for now, suffixed when a run with the same second already exists.
fn unique_run_dir(layout: &RunLayout) -> Result<(String, PathBuf)> {
    let base = new_run_id();
    for attempt in 0..100u32 {
        let run_id = if attempt == 0 {
            base.clone()
        } else {
            format!("{base}_{attempt}")
        };
        let run_dir = layout.run_dir(&run_id);
        if !run_dir.exists() {
            return Ok((run_id, run_dir));
        }
    }
    Err(anyhow!("could not allocate a run directory for {base}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_missing_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = RunLayout::for_plan(&temp.path().join("missing.md")).expect("layout");
        let store = StateStore::new(&layout.state_path);
        let err = start_run(&layout, &store, Mode::Auto, Some(3)).unwrap_err();
        assert!(err.to_string().contains("plan file not found"));
        assert!(!layout.base_dir.exists());
    }

    #[test]
    fn start_writes_snapshot_and_fresh_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan_path = temp.path().join("plan.md");
        fs::write(&plan_path, "# Goal\n## Scope\nSmall.\n").expect("write plan");
        let layout = RunLayout::for_plan(&plan_path).expect("layout");
        let store = StateStore::new(&layout.state_path);

        // A stale stop request from an older run must not leak into the new one.
        fs::create_dir_all(&layout.state_dir).expect("mkdir");
        fs::write(&layout.state_path, "{\"stop_requested\": true}").expect("write");

        let (state, snapshot) = start_run(&layout, &store, Mode::Manual, None).expect("start");
        assert_eq!(snapshot.goal, "Goal");
        assert!(layout.objective_path.is_file());
        assert!(state.run_dir.join("objective_snapshot.json").is_file());
        assert_eq!(state.round, 0);
        assert_eq!(state.current_lane, crate::core::types::Lane::Manual);
        assert!(!store.stop_requested());
        assert_eq!(store.load().expect("load"), state);
    }

    #[test]
    fn second_run_in_same_second_gets_distinct_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan_path = temp.path().join("plan.md");
        fs::write(&plan_path, "# Goal\n").expect("write plan");
        let layout = RunLayout::for_plan(&plan_path).expect("layout");
        layout.ensure().expect("ensure");
        let (first_id, first_dir) = unique_run_dir(&layout).expect("first");
        fs::create_dir_all(&first_dir).expect("mkdir");
        let (second_id, _) = unique_run_dir(&layout).expect("second");
        assert_ne!(first_id, second_id);
    }

    #[test]
    fn resume_rebuilds_missing_snapshot_and_clears_flags() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan_path = temp.path().join("plan.md");
        fs::write(&plan_path, "# Original\n").expect("write plan");
        let layout = RunLayout::for_plan(&plan_path).expect("layout");
        let store = StateStore::new(&layout.state_path);
        let (mut state, _) = start_run(&layout, &store, Mode::Hybrid, Some(5)).expect("start");

        state.status = RunStatus::Stopped;
        state.stop_requested = true;
        state.error = Some("old".to_string());
        store.save(&mut state).expect("save");
        fs::remove_file(&layout.objective_path).expect("remove snapshot");

        let (resumed, snapshot) = resume_run(&layout, &store).expect("resume");
        assert_eq!(resumed.status, RunStatus::Running);
        assert!(!resumed.stop_requested);
        assert_eq!(resumed.error, None);
        assert_eq!(resumed.max_rounds, Some(5));
        assert_eq!(snapshot.goal, "Original");
        assert!(layout.objective_path.is_file());
        assert!(!store.stop_requested());
    }

    #[test]
    fn resume_rejects_completed_and_missing_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan_path = temp.path().join("plan.md");
        fs::write(&plan_path, "# Original\n").expect("write plan");
        let layout = RunLayout::for_plan(&plan_path).expect("layout");
        let store = StateStore::new(&layout.state_path);

        let err = resume_run(&layout, &store).unwrap_err();
        assert!(err.to_string().contains("missing run state"));

        let (mut state, _) = start_run(&layout, &store, Mode::Auto, Some(5)).expect("start");
        state.status = RunStatus::NeedsHumanTiebreaker;
        store.save(&mut state).expect("save");
        let err = resume_run(&layout, &store).unwrap_err();
        assert!(err.to_string().contains("completed run"));

        state.status = RunStatus::Error;
        state.current_plan_path = temp.path().join("gone.md");
        store.save(&mut state).expect("save");
        let err = resume_run(&layout, &store).unwrap_err();
        assert!(err.to_string().contains("current plan not found"));
    }
}
