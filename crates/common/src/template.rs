//! Prompt templates.
//!
//! A template file maps each [`TemplateVariant`] to one pattern or a list of
//! patterns. Patterns use `{instruction}` and `{input}` slots; any other text,
//! braces included, is copied verbatim.
//!
//! ```json
//! {
//!   "prompts_input": "### Instruction:\n{instruction}\n### Input:\n{input}\n### Response:\n",
//!   "prompts_no_input": ["### Instruction:\n{instruction}\n### Response:\n"]
//! }
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{InstructError, Result};

const INSTRUCTION_SLOT: &str = "{instruction}";
const INPUT_SLOT: &str = "{input}";

/// Which template shape an example needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateVariant {
    /// Instruction plus a separate, non-empty input.
    Input,
    /// Instruction only.
    NoInput,
}

impl TemplateVariant {
    /// Key used in template files.
    pub fn key(self) -> &'static str {
        match self {
            Self::Input => "prompts_input",
            Self::NoInput => "prompts_no_input",
        }
    }
}

impl fmt::Display for TemplateVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Patterns {
    One(String),
    Many(Vec<String>),
}

impl Patterns {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(p) => vec![p],
            Self::Many(ps) => ps,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    prompts_input: Option<Patterns>,
    #[serde(default)]
    prompts_no_input: Option<Patterns>,
}

/// Read-only set of prompt patterns, shared by every example.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    input: Vec<String>,
    no_input: Vec<String>,
}

impl TemplateSet {
    /// Build from explicit pattern lists. `no_input` must be non-empty.
    pub fn new(input: Vec<String>, no_input: Vec<String>) -> Result<Self> {
        if no_input.is_empty() {
            return Err(InstructError::MissingTemplate(TemplateVariant::NoInput));
        }
        for p in &no_input {
            if !p.contains(INSTRUCTION_SLOT) {
                return Err(InstructError::Config(format!(
                    "no-input pattern lacks {INSTRUCTION_SLOT}: {p:?}"
                )));
            }
        }
        for p in &input {
            if !p.contains(INSTRUCTION_SLOT) || !p.contains(INPUT_SLOT) {
                return Err(InstructError::Config(format!(
                    "input pattern needs both {INSTRUCTION_SLOT} and {INPUT_SLOT}: {p:?}"
                )));
            }
        }
        Ok(Self { input, no_input })
    }

    /// Parse a template file body.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: TemplateFile = serde_json::from_str(json)?;
        Self::new(
            file.prompts_input.map(Patterns::into_vec).unwrap_or_default(),
            file.prompts_no_input.map(Patterns::into_vec).unwrap_or_default(),
        )
    }

    /// Load a template file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let set = Self::from_json(&json)?;
        tracing::debug!(
            path = %path.display(),
            input = set.input.len(),
            no_input = set.no_input.len(),
            "templates loaded"
        );
        Ok(set)
    }

    /// Patterns registered for a variant (possibly empty).
    pub fn patterns(&self, variant: TemplateVariant) -> &[String] {
        match variant {
            TemplateVariant::Input => &self.input,
            TemplateVariant::NoInput => &self.no_input,
        }
    }

    /// Render a prompt.
    ///
    /// The variant is `Input` iff `input` is non-empty after trimming. With
    /// several patterns the one at `selector % len` is used, so a record
    /// always renders the same way.
    pub fn render(&self, instruction: &str, input: Option<&str>, selector: usize) -> Result<String> {
        let input = input.map(str::trim).filter(|s| !s.is_empty());
        let variant = if input.is_some() {
            TemplateVariant::Input
        } else {
            TemplateVariant::NoInput
        };
        let patterns = self.patterns(variant);
        if patterns.is_empty() {
            return Err(InstructError::MissingTemplate(variant));
        }
        let pattern = &patterns[selector % patterns.len()];
        Ok(fill(pattern, instruction.trim(), input.unwrap_or("")))
    }
}

/// Single pass over `pattern`, so slot-like text inside the values is never expanded.
fn fill(pattern: &str, instruction: &str, input: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + instruction.len() + input.len());
    let mut rest = pattern;
    loop {
        let next = [(INSTRUCTION_SLOT, instruction), (INPUT_SLOT, input)]
            .into_iter()
            .filter_map(|(slot, value)| rest.find(slot).map(|at| (at, slot, value)))
            .min_by_key(|(at, _, _)| *at);
        match next {
            Some((at, slot, value)) => {
                out.push_str(&rest[..at]);
                out.push_str(value);
                rest = &rest[at + slot.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}
