//! Best-effort extraction of a schema-conformant object from agent output.
//!
//! Agents are asked for a single JSON object but frequently wrap it in
//! commentary or code fences. Extraction tries independent candidate
//! strategies in a fixed order and stops at the first candidate that decodes
//! to a JSON object and passes schema validation.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::schema::Schema;

pub const NO_OBJECT_ERROR: &str = "No JSON object could be parsed from output.";

/// Strategy that produced a candidate. Earlier variants take precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExtractMode {
    Strict,
    FirstLine,
    Fenced,
    EmbeddedObject,
}

impl ExtractMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractMode::Strict => "strict",
            ExtractMode::FirstLine => "first-line",
            ExtractMode::Fenced => "fenced",
            ExtractMode::EmbeddedObject => "embedded-object",
        }
    }
}

/// Result of running every strategy over one piece of output.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub value: Option<Map<String, Value>>,
    pub mode: Option<ExtractMode>,
    pub errors: Vec<String>,
}

impl Extraction {
    /// Mode tag for artifacts and logs (`none` when nothing decoded).
    pub fn mode_tag(&self) -> &'static str {
        self.mode.map(ExtractMode::as_str).unwrap_or("none")
    }
}

/// Run all strategies over `raw` and return the first schema-valid object.
pub fn extract(raw: &str, schema: &Schema) -> Extraction {
    let mut first_invalid: Option<(ExtractMode, Vec<String>)> = None;

    for (mode, payload) in candidates(raw) {
        let Some(object) = decode_object(&payload) else {
            continue;
        };
        let value = Value::Object(object);
        let errors = schema.validate(&value);
        if errors.is_empty()
            && let Value::Object(object) = value
        {
            return Extraction {
                value: Some(object),
                mode: Some(mode),
                errors: Vec::new(),
            };
        }
        if first_invalid.is_none() {
            first_invalid = Some((mode, errors));
        }
    }

    match first_invalid {
        Some((mode, errors)) => Extraction {
            value: None,
            mode: Some(mode),
            errors,
        },
        None => Extraction {
            value: None,
            mode: None,
            errors: vec![NO_OBJECT_ERROR.to_string()],
        },
    }
}

/// All candidate payloads in precedence order.
pub fn candidates(raw: &str) -> Vec<(ExtractMode, String)> {
    let mut out = Vec::new();
    let stripped = raw.trim();
    if !stripped.is_empty() {
        out.push((ExtractMode::Strict, stripped.to_string()));
    }
    if let Some(first_line) = stripped.lines().next().map(str::trim)
        && !first_line.is_empty()
    {
        out.push((ExtractMode::FirstLine, first_line.to_string()));
    }
    out.extend(
        fenced_blocks(raw)
            .into_iter()
            .map(|block| (ExtractMode::Fenced, block)),
    );
    out.extend(
        embedded_objects(raw)
            .into_iter()
            .map(|obj| (ExtractMode::EmbeddedObject, obj.to_string())),
    );
    out
}

/// Contents of every fenced code block, with an optional language tag.
pub fn fenced_blocks(raw: &str) -> Vec<String> {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?is)```[a-z0-9_+-]*(.*?)```").expect("fence regex is valid")
    });
    FENCE_RE
        .captures_iter(raw)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|block| !block.is_empty())
        .collect()
}

/// Every top-level balanced `{...}` span in `raw`.
///
/// Braces inside string literals are ignored; escaped quotes do not end a
/// string. An unterminated trailing span is dropped.
pub fn embedded_objects(raw: &str) -> Vec<&str> {
    let mut objects = Vec::new();
    let mut start: Option<usize> = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in raw.char_indices() {
        let Some(begin) = start else {
            if ch == '{' {
                start = Some(idx);
                depth = 1;
                in_string = false;
                escaped = false;
            }
            continue;
        };

        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    objects.push(&raw[begin..idx + ch.len_utf8()]);
                    start = None;
                }
            }
            _ => {}
        }
    }
    objects
}

fn decode_object(payload: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}
