//! Final Markdown report (`final/final_report.md`).

use std::path::PathBuf;

use anyhow::Result;

use crate::core::types::{RoundStatus, RunStatus};
use crate::io::layout::RunLayout;
use crate::io::round_log::{RoundSummary, collect_round_summaries, write_text};
use crate::io::run_state::RunState;

/// Render the report for `state` and write it; returns the report path.
pub fn write_report(layout: &RunLayout, state: &RunState) -> Result<PathBuf> {
    let summaries = collect_round_summaries(&state.run_dir)?;
    let report = render_report(layout, state, &summaries);
    write_text(&layout.final_report_path, &report)?;
    Ok(layout.final_report_path.clone())
}

pub fn render_report(layout: &RunLayout, state: &RunState, summaries: &[RoundSummary]) -> String {
    let mut lines = vec![
        "# Plan Loop Final Report".to_string(),
        String::new(),
        format!("- status: `{}`", state.status.as_str()),
        format!("- run_id: `{}`", state.run_id),
        format!("- rounds_completed: `{}`", state.round),
        format!("- mode: `{}`", state.mode.as_str()),
        format!("- current_lane: `{}`", state.current_lane.as_str()),
        format!("- started_at: `{}`", state.started_at),
        format!("- ended_at: `{}`", state.last_updated_at),
    ];
    if let Some(error) = &state.error {
        lines.push(format!("- error: `{}`", single_line(error)));
    }
    lines.push(String::new());

    if !summaries.is_empty() {
        lines.push("| Round | Lane | Judge Pass | Problems | Blocking | Summary |".to_string());
        lines.push("| --- | --- | --- | --- | --- | --- |".to_string());
        for item in summaries {
            let text = match (&item.error, item.status) {
                (Some(error), _) => format!("error: {error}"),
                (None, RoundStatus::Stopped) => "stopped".to_string(),
                (None, _) => item.judge_summary.clone(),
            };
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} |",
                item.round,
                item.lane.as_str(),
                item.judge_pass,
                item.problem_count,
                item.blocking,
                single_line(&text).replace('|', "/"),
            ));
        }
        lines.push(String::new());
    }

    let approved = state
        .approved_plan_path
        .as_ref()
        .map_or_else(|| "none".to_string(), |p| format!("`{}`", p.display()));
    lines.extend([
        "## Artifacts".to_string(),
        String::new(),
        format!("- latest_plan: `{}`", state.current_plan_path.display()),
        format!("- run_dir: `{}`", state.run_dir.display()),
        format!("- approved_plan: {approved}"),
        format!("- state: `{}`", layout.state_path.display()),
        String::new(),
        result_line(state.status).to_string(),
        String::new(),
        "Manual review is required before implementation.".to_string(),
        String::new(),
    ]);
    lines.join("\n")
}

fn result_line(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Passed => "Result: strict pass achieved (`pass=true` and `problems=[]`).",
        RunStatus::NeedsHumanTiebreaker => "Result: max rounds reached without strict pass.",
        RunStatus::Stopped => "Result: stopped manually.",
        RunStatus::Error => "Result: run failed before reaching a strict pass.",
        RunStatus::Running => "Result: run ended without strict pass.",
    }
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
