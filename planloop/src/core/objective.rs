//! Objective snapshot: a fixed digest of the original plan.
//!
//! Built once from the plan a run starts with and attached to every prompt, so
//! later rounds are judged against the original intent even after the plan
//! text has been rewritten many times.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const EXCERPT_CHARS: usize = 1800;
const RAW_EXCERPT_CHARS: usize = 2400;
const FALLBACK_GOAL: &str = "Plan quality feedback loop";
const ROOT_SECTION: &str = "_root";

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,3}\s+(.+?)\s*$").expect("heading regex is valid"));
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#\s+(.+?)\s*$").expect("title regex is valid"));
static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\s+").expect("numbered regex is valid"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectiveSnapshot {
    pub goal: String,
    pub summary_excerpt: String,
    pub scope_excerpt: String,
    pub acceptance_criteria: Vec<String>,
    pub constraints: Vec<String>,
    pub raw_excerpt: String,
}

impl ObjectiveSnapshot {
    pub fn from_plan(plan: &str) -> Self {
        let sections = split_sections(plan);
        let section = |name: &str| sections.get(name).map(String::as_str).unwrap_or("");
        let summary = section("summary");

        let goal = TITLE_RE
            .captures(plan)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|g| !g.is_empty())
            .or_else(|| {
                summary
                    .lines()
                    .next()
                    .map(|line| line.trim().to_string())
                    .filter(|line| !line.is_empty())
            })
            .unwrap_or_else(|| FALLBACK_GOAL.to_string());

        Self {
            goal,
            summary_excerpt: truncate_chars(summary, EXCERPT_CHARS),
            scope_excerpt: truncate_chars(section("scope"), EXCERPT_CHARS),
            acceptance_criteria: list_items(section("acceptance criteria")),
            constraints: list_items(section("assumptions and defaults")),
            raw_excerpt: truncate_chars(plan, RAW_EXCERPT_CHARS),
        }
    }
}

/// Split markdown into sections keyed by normalized heading title (levels 1-3).
pub fn split_sections(markdown: &str) -> BTreeMap<String, String> {
    let mut sections: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    let mut current = ROOT_SECTION.to_string();
    sections.insert(current.clone(), Vec::new());

    for line in markdown.lines() {
        if let Some(caps) = HEADING_RE.captures(line) {
            current = normalize_title(&caps[1]);
            sections.entry(current.clone()).or_default();
            continue;
        }
        sections.entry(current.clone()).or_default().push(line);
    }

    sections
        .into_iter()
        .map(|(title, lines)| (title, lines.join("\n").trim().to_string()))
        .collect()
}

/// Bullet (`- x`) and numbered (`1. x`) list items, in order.
pub fn list_items(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter_map(|line| {
            if NUMBERED_RE.is_match(line) {
                Some(NUMBERED_RE.replace(line, "").trim().to_string())
            } else {
                line.strip_prefix("- ").map(|rest| rest.trim().to_string())
            }
        })
        .collect()
}

fn normalize_title(title: &str) -> String {
    WHITESPACE_RE
        .replace_all(title.trim(), " ")
        .to_lowercase()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "\
# Ship the Importer

## Summary
Build a CSV importer for billing.
Second line.

## Scope
Only CSV.

## Acceptance Criteria
1. Imports 10k rows
2. Rejects bad headers
- Logs failures

## Assumptions   and Defaults
- UTF-8 input
not a list item
";

    #[test]
    fn builds_snapshot_from_sections() {
        let snapshot = ObjectiveSnapshot::from_plan(PLAN);
        assert_eq!(snapshot.goal, "Ship the Importer");
        assert_eq!(
            snapshot.summary_excerpt,
            "Build a CSV importer for billing.\nSecond line."
        );
        assert_eq!(snapshot.scope_excerpt, "Only CSV.");
        assert_eq!(
            snapshot.acceptance_criteria,
            vec!["Imports 10k rows", "Rejects bad headers", "Logs failures"]
        );
        assert_eq!(snapshot.constraints, vec!["UTF-8 input"]);
        assert_eq!(snapshot.raw_excerpt, PLAN);
    }

    #[test]
    fn goal_falls_back_to_summary_then_default() {
        let snapshot = ObjectiveSnapshot::from_plan("## Summary\nMigrate auth\n");
        assert_eq!(snapshot.goal, "Migrate auth");

        let snapshot = ObjectiveSnapshot::from_plan("just some text\n");
        assert_eq!(snapshot.goal, FALLBACK_GOAL);
    }

    #[test]
    fn excerpts_are_truncated_by_characters() {
        let long = format!("## Summary\n{}\n", "é".repeat(RAW_EXCERPT_CHARS + 50));
        let snapshot = ObjectiveSnapshot::from_plan(&long);
        assert_eq!(snapshot.summary_excerpt.chars().count(), EXCERPT_CHARS);
        assert_eq!(snapshot.raw_excerpt.chars().count(), RAW_EXCERPT_CHARS);
    }

    #[test]
    fn text_before_first_heading_goes_to_root() {
        let sections = split_sections("preamble\n# Title\nbody\n");
        assert_eq!(sections.get(ROOT_SECTION).map(String::as_str), Some("preamble"));
        assert_eq!(sections.get("title").map(String::as_str), Some("body"));
    }
}
