//! Prompt composition for the judge, rewrite and repair invocations.
//!
//! Judge and rewrite prompts are rendered from minijinja skeletons whose parts
//! are delimited by `<!-- section:KEY required|droppable -->` markers. When the
//! rendered prompt exceeds the byte budget, droppable sections go first and
//! the last section is truncated if that is still not enough.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::objective::ObjectiveSnapshot;
use crate::core::types::JudgeResult;

const JUDGE_TEMPLATE: &str = include_str!("prompts/judge.md");
const REWRITE_TEMPLATE: &str = include_str!("prompts/rewrite.md");

/// Characters of failed output quoted back in a repair prompt.
pub const REPAIR_RAW_LIMIT_CHARS: usize = 24_000;

const TRUNCATION_NOTE: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex is valid")
});

/// Inputs shared by both phase prompts.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub objective_header: &'a str,
    pub snapshot: &'a ObjectiveSnapshot,
    /// Already limited to the entries that should be shown.
    pub recent_fixes: &'a [String],
    pub plan: &'a str,
}

/// Renders phase prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("judge", JUDGE_TEMPLATE)
            .context("load judge prompt template")?;
        env.add_template("rewrite", REWRITE_TEMPLATE)
            .context("load rewrite prompt template")?;
        Ok(Self { env, budget_bytes })
    }

    pub fn judge(&self, ctx: &PromptContext<'_>, rubric: &str) -> Result<String> {
        let rendered = self
            .env
            .get_template("judge")?
            .render(context! {
                objective_header => ctx.objective_header.trim(),
                rubric => rubric.trim(),
                snapshot => snapshot_json(ctx.snapshot)?,
                recent_fixes => format_list(ctx.recent_fixes),
                plan => ctx.plan,
            })
            .context("render judge prompt")?;
        Ok(self.fit(&rendered))
    }

    pub fn rewrite(
        &self,
        ctx: &PromptContext<'_>,
        rewrite_task: &str,
        judge: &JudgeResult,
    ) -> Result<String> {
        let judge_json =
            serde_json::to_string_pretty(judge).context("serialize judge result")?;
        let rendered = self
            .env
            .get_template("rewrite")?
            .render(context! {
                objective_header => ctx.objective_header.trim(),
                rewrite_task => rewrite_task.trim(),
                snapshot => snapshot_json(ctx.snapshot)?,
                recent_fixes => format_list(ctx.recent_fixes),
                judge_result => judge_json,
                rewrite_instructions => format_list(&judge.rewrite_instructions),
                problems => format_list(&judge.problems),
                plan => ctx.plan,
            })
            .context("render rewrite prompt")?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        let mut out = render_sections(&sections);
        out.push('\n');
        out
    }
}

/// Prompt asking the agent to turn `raw_output` into one schema-valid object.
pub fn repair_prompt(schema_pretty: &str, raw_output: &str) -> String {
    let quoted: String = raw_output.chars().take(REPAIR_RAW_LIMIT_CHARS).collect();
    format!(
        "You are a strict JSON repair tool.\n\
         Return only one JSON object that conforms exactly to the schema.\n\
         Do not add commentary.\n\n\
         Schema:\n{schema_pretty}\n\n\
         Raw output to repair:\n```text\n{quoted}\n```\n"
    )
}

/// `- item` per line, or `[]` for an empty list.
pub fn format_list(items: &[String]) -> String {
    if items.is_empty() {
        return "[]".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn snapshot_json(snapshot: &ObjectiveSnapshot) -> Result<String> {
    serde_json::to_string_pretty(snapshot).map_err(|err| anyhow!("serialize snapshot: {err}"))
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn rendered_len(sections: &[Section]) -> usize {
    let separators = sections.len().saturating_sub(1) * 2;
    sections.iter().map(|s| s.content.len()).sum::<usize>() + separators
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    while rendered_len(sections) > budget {
        let Some(idx) = sections.iter().position(|s| !s.required) else {
            break;
        };
        let dropped = sections.remove(idx);
        debug!(
            section = %dropped.key,
            bytes_dropped = dropped.content.len(),
            "dropped prompt section for budget"
        );
    }

    let total = rendered_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let before_len = last.content.len();
    let allowed = before_len.saturating_sub(total - budget);
    if allowed > TRUNCATION_NOTE.len() {
        truncate_at_char_boundary(&mut last.content, allowed - TRUNCATION_NOTE.len());
        last.content.push_str(TRUNCATION_NOTE);
    } else {
        truncate_at_char_boundary(&mut last.content, allowed);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated prompt section for budget"
    );
}

fn truncate_at_char_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
