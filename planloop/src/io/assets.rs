//! Prompt templates and result schemas read from an assets directory.
//!
//! ```text
//! <assets>/prompts/{objective_header.md, judge_rubric.md, rewrite_prompt.md}
//! <assets>/schemas/{plan_judge_result.schema.json, plan_rewrite_result.schema.json}
//! ```
//!
//! Everything is loaded once before the first round; a missing file or a
//! schema that does not compile is a configuration error. The built-in set is
//! compiled into the binary and written out by [`Assets::builtin`], since the
//! agent takes its schema as a file path.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde_json::Value;
use tracing::debug;

use super::round_log::write_text;
use crate::core::schema::Schema;
use crate::core::types::Phase;

/// Built-in assets as `(path relative to the assets dir, contents)`.
pub const BUILTIN_ASSETS: [(&str, &str); 5] = [
    (
        "prompts/objective_header.md",
        include_str!("../../assets/prompts/objective_header.md"),
    ),
    (
        "prompts/judge_rubric.md",
        include_str!("../../assets/prompts/judge_rubric.md"),
    ),
    (
        "prompts/rewrite_prompt.md",
        include_str!("../../assets/prompts/rewrite_prompt.md"),
    ),
    (
        "schemas/plan_judge_result.schema.json",
        include_str!("../../assets/schemas/plan_judge_result.schema.json"),
    ),
    (
        "schemas/plan_rewrite_result.schema.json",
        include_str!("../../assets/schemas/plan_rewrite_result.schema.json"),
    ),
];

/// Write the built-in assets under `dir`, replacing stale copies.
pub fn write_builtin(dir: &Path) -> Result<()> {
    for (relative, contents) in BUILTIN_ASSETS {
        write_text(&dir.join(relative), contents)?;
    }
    debug!(dir = %dir.display(), "wrote built-in assets");
    Ok(())
}

/// A result schema: where it lives (handed to the agent) and its parsed forms.
#[derive(Debug, Clone)]
pub struct PhaseSchema {
    pub path: PathBuf,
    pub raw: Value,
    pub compiled: Schema,
}

impl PhaseSchema {
    pub fn load(path: &Path) -> Result<Self> {
        let path = path
            .canonicalize()
            .with_context(|| format!("schema file not found: {}", path.display()))?;
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read schema {}", path.display()))?;
        let raw: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse schema {}", path.display()))?;
        if !raw.is_object() {
            return Err(anyhow!("schema {} must be a JSON object", path.display()));
        }
        jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&raw)
            .map_err(|err| anyhow!("{err}"))
            .with_context(|| format!("compile schema {}", path.display()))?;
        let compiled = Schema::from_value(&raw);
        Ok(Self {
            path,
            raw,
            compiled,
        })
    }

    /// Schema as indented JSON, for repair prompts.
    pub fn pretty(&self) -> String {
        serde_json::to_string_pretty(&self.raw).unwrap_or_else(|_| self.raw.to_string())
    }
}

/// Everything the loop reads from the assets directory.
#[derive(Debug, Clone)]
pub struct Assets {
    pub objective_header: String,
    pub judge_rubric: String,
    pub rewrite_prompt: String,
    pub judge_schema: PhaseSchema,
    pub rewrite_schema: PhaseSchema,
}

impl Assets {
    pub fn load(dir: &Path) -> Result<Self> {
        debug!(dir = %dir.display(), "loading assets");
        let prompts = dir.join("prompts");
        let schemas = dir.join("schemas");
        Ok(Self {
            objective_header: read_required(&prompts.join("objective_header.md"))?,
            judge_rubric: read_required(&prompts.join("judge_rubric.md"))?,
            rewrite_prompt: read_required(&prompts.join("rewrite_prompt.md"))?,
            judge_schema: PhaseSchema::load(&schemas.join("plan_judge_result.schema.json"))?,
            rewrite_schema: PhaseSchema::load(&schemas.join("plan_rewrite_result.schema.json"))?,
        })
    }

    /// Write the built-in assets to `dir` and load them from there.
    pub fn builtin(dir: &Path) -> Result<Self> {
        write_builtin(dir)?;
        Self::load(dir)
    }

    pub fn schema(&self, phase: Phase) -> &PhaseSchema {
        match phase {
            Phase::Judge => &self.judge_schema,
            Phase::Rewrite => &self.rewrite_schema,
        }
    }
}

fn read_required(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(anyhow!("required file not found: {}", path.display()));
    }
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}
