//! Multi-step prompt templates
//!
//! A template is an ordered list of steps. Prompts may reference the seed
//! record, the seed index and the outputs of earlier steps through
//! `{{...}}` placeholders:
//!
//! - `{{seed}}` the whole seed (strings verbatim, other values as JSON)
//! - `{{seed.field}}` one top-level field of an object seed
//! - `{{steps.<id>}}` the output of an earlier step
//! - `{{index}}` the seed index of the record
//!
//! Templates are validated when loaded so that a bad reference fails the job
//! once instead of failing every record.

use crate::batch::StepOutput;
use crate::error::{InferenceError, TemplateError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

mod source;

pub use source::{FsTemplateSource, TemplateSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSpec {
    /// Free-form generation.
    Generate {
        id: String,
        #[serde(default)]
        model: Option<String>,
        prompt: String,
    },
    /// Generation whose output must be one of `labels`.
    Classify {
        id: String,
        #[serde(default)]
        model: Option<String>,
        prompt: String,
        labels: Vec<String>,
    },
    /// Local rewrite of an earlier step's output; no inference call.
    Transform {
        id: String,
        source: String,
        op: TransformOp,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOp {
    Trim,
    Lowercase,
    Uppercase,
    FirstLine,
}

impl TransformOp {
    pub fn apply(self, text: &str) -> String {
        match self {
            TransformOp::Trim => text.trim().to_string(),
            TransformOp::Lowercase => text.to_lowercase(),
            TransformOp::Uppercase => text.to_uppercase(),
            TransformOp::FirstLine => text.lines().next().unwrap_or("").trim().to_string(),
        }
    }
}

impl StepSpec {
    pub fn id(&self) -> &str {
        match self {
            StepSpec::Generate { id, .. }
            | StepSpec::Classify { id, .. }
            | StepSpec::Transform { id, .. } => id,
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        match self {
            StepSpec::Generate { prompt, .. } | StepSpec::Classify { prompt, .. } => Some(prompt),
            StepSpec::Transform { .. } => None,
        }
    }

    /// Whether running this step costs an inference call.
    pub fn invokes_model(&self) -> bool {
        !matches!(self, StepSpec::Transform { .. })
    }
}

/// A parsed `{{...}}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder<'a> {
    Seed,
    SeedField(&'a str),
    Step(&'a str),
    Index,
}

fn parse_placeholder(raw: &str) -> Option<Placeholder<'_>> {
    let key = raw.trim();
    match key {
        "seed" => Some(Placeholder::Seed),
        "index" => Some(Placeholder::Index),
        _ => {
            if let Some(field) = key.strip_prefix("seed.") {
                (!field.is_empty()).then_some(Placeholder::SeedField(field))
            } else if let Some(step) = key.strip_prefix("steps.") {
                (!step.is_empty()).then_some(Placeholder::Step(step))
            } else {
                None
            }
        }
    }
}

/// Split a prompt into literal text and placeholder bodies.
fn segments(prompt: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = prompt;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        if start > 0 {
            out.push(Segment::Text(&rest[..start]));
        }
        out.push(Segment::Placeholder(&rest[start + 2..start + 2 + len]));
        rest = &rest[start + 2 + len + 2..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    out
}

enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

fn seed_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Template {
    /// Check step ids and references. Called by every template source.
    pub fn validate(&self) -> Result<(), TemplateError> {
        let name = format!("{}@{}", self.id, self.version);
        if self.steps.is_empty() {
            return Err(TemplateError::Empty { template: name });
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            let step_id = step.id();
            if step_id.trim().is_empty() {
                return Err(TemplateError::InvalidStep {
                    step_id: step_id.to_string(),
                    message: "step id cannot be empty".to_string(),
                });
            }

            if let Some(prompt) = step.prompt() {
                if prompt.trim().is_empty() {
                    return Err(TemplateError::InvalidStep {
                        step_id: step_id.to_string(),
                        message: "prompt cannot be empty".to_string(),
                    });
                }
                for segment in segments(prompt) {
                    let Segment::Placeholder(raw) = segment else {
                        continue;
                    };
                    match parse_placeholder(raw) {
                        Some(Placeholder::Step(reference)) if !seen.contains(reference) => {
                            return Err(TemplateError::UnresolvedReference {
                                step_id: step_id.to_string(),
                                reference: reference.to_string(),
                            });
                        }
                        Some(_) => {}
                        None => {
                            return Err(TemplateError::InvalidStep {
                                step_id: step_id.to_string(),
                                message: format!("unknown placeholder '{{{{{}}}}}'", raw.trim()),
                            });
                        }
                    }
                }
            }

            match step {
                StepSpec::Classify { labels, .. } if labels.is_empty() => {
                    return Err(TemplateError::InvalidStep {
                        step_id: step_id.to_string(),
                        message: "classify step needs at least one label".to_string(),
                    });
                }
                StepSpec::Transform { source, .. } if !seen.contains(source.as_str()) => {
                    return Err(TemplateError::UnresolvedReference {
                        step_id: step_id.to_string(),
                        reference: source.clone(),
                    });
                }
                _ => {}
            }

            if !seen.insert(step_id) {
                return Err(TemplateError::DuplicateStep {
                    template: name,
                    step_id: step_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Number of steps that call the inference service.
    pub fn invocations_per_record(&self) -> usize {
        self.steps.iter().filter(|s| s.invokes_model()).count()
    }
}

/// Render a step prompt against the seed, the seed index and prior outputs.
///
/// A seed field missing from this record fails only this record.
pub fn render_prompt(
    prompt: &str,
    seed: &serde_json::Value,
    seed_index: u64,
    prior: &[StepOutput],
) -> Result<String, InferenceError> {
    let mut rendered = String::with_capacity(prompt.len());
    for segment in segments(prompt) {
        match segment {
            Segment::Text(text) => rendered.push_str(text),
            Segment::Placeholder(raw) => match parse_placeholder(raw) {
                Some(Placeholder::Seed) => rendered.push_str(&seed_text(seed)),
                Some(Placeholder::Index) => rendered.push_str(&seed_index.to_string()),
                Some(Placeholder::SeedField(field)) => {
                    let value = seed.get(field).ok_or_else(|| {
                        InferenceError::ValidationError(format!(
                            "seed {} has no field '{}'",
                            seed_index, field
                        ))
                    })?;
                    rendered.push_str(&seed_text(value));
                }
                Some(Placeholder::Step(step_id)) => {
                    let output = prior
                        .iter()
                        .find(|o| o.step_id == step_id)
                        .ok_or_else(|| {
                            InferenceError::ValidationError(format!(
                                "step output '{}' not available",
                                step_id
                            ))
                        })?;
                    rendered.push_str(&output.text);
                }
                None => {
                    rendered.push_str("{{");
                    rendered.push_str(raw);
                    rendered.push_str("}}");
                }
            },
        }
    }
    Ok(rendered)
}

/// Match a model answer against the allowed labels, case-insensitively.
pub fn match_label(output: &str, labels: &[String]) -> Result<String, InferenceError> {
    let answer = output.trim();
    labels
        .iter()
        .find(|label| label.eq_ignore_ascii_case(answer))
        .cloned()
        .ok_or_else(|| {
            InferenceError::ValidationError(format!(
                "'{}' is not one of {:?}",
                answer, labels
            ))
        })
}
