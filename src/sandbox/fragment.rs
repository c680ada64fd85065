//! The fragment language.
//!
//! A fragment is a JSON program of steps, each naming one of four
//! operations. There is nothing else it can express: no loops, no
//! expressions, no host calls. Unknown operations or fields fail at
//! parse time, before any step runs.
//!
//! Step outputs can be bound with `save_as` and referenced from later
//! string fields as `{{name}}`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Fragment {
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    ReadFile {
        path: String,
        #[serde(default)]
        save_as: Option<String>,
    },
    WriteFile {
        path: String,
        content: String,
    },
    RunCommand {
        command: String,
        #[serde(default)]
        save_as: Option<String>,
    },
    LlmQuery {
        prompt: String,
        #[serde(default)]
        image_path: Option<String>,
        #[serde(default)]
        save_as: Option<String>,
    },
}

impl Step {
    /// Operation name as it appears in the fragment.
    pub fn op(&self) -> &'static str {
        match self {
            Step::ReadFile { .. } => "read_file",
            Step::WriteFile { .. } => "write_file",
            Step::RunCommand { .. } => "run_command",
            Step::LlmQuery { .. } => "llm_query",
        }
    }

    pub fn save_as(&self) -> Option<&str> {
        match self {
            Step::ReadFile { save_as, .. }
            | Step::RunCommand { save_as, .. }
            | Step::LlmQuery { save_as, .. } => save_as.as_deref(),
            Step::WriteFile { .. } => None,
        }
    }
}

impl Fragment {
    /// Parses model output into a fragment, tolerating prose or a code
    /// fence around the JSON object.
    pub fn parse(text: &str, max_steps: usize) -> Result<Self> {
        let json = extract_json(text).ok_or_else(|| {
            SandboxError::SandboxExecution("fragment does not contain a JSON object".to_string())
        })?;
        let fragment: Fragment = serde_json::from_str(json)
            .map_err(|e| SandboxError::SandboxExecution(format!("invalid fragment: {e}")))?;

        if fragment.steps.len() > max_steps {
            return Err(SandboxError::SandboxExecution(format!(
                "fragment has {} steps (max {max_steps})",
                fragment.steps.len()
            )));
        }
        Ok(fragment)
    }
}

/// Outermost `{ ... }` span of `text`.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

/// Replaces `{{name}}` placeholders with bound values.
///
/// Whitespace inside the braces is ignored. An unbound name is an error
/// rather than an empty substitution, so a typo cannot silently write an
/// empty file.
pub fn interpolate(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let name = after_open[..close].trim();
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => {
                return Err(SandboxError::SandboxExecution(format!(
                    "undefined variable '{name}'"
                )))
            }
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
