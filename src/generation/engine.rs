//! Per-record generation: runs every template step for one seed.

use crate::batch::{GeneratedRecord, StepOutput};
use crate::config::PricingConfig;
use crate::error::InferenceError;
use crate::inference::InferenceService;
use crate::ledger::BudgetLedger;
use crate::template::{match_label, render_prompt, StepSpec, Template};
use crate::types::record_id;
use std::sync::Arc;
use tracing::trace;

pub struct GenerationEngine {
    inference: Arc<dyn InferenceService>,
    pricing: PricingConfig,
    default_model: String,
}

/// Seed input of one record.
pub struct RecordInput<'a> {
    pub job_id: &'a str,
    pub seed: &'a serde_json::Value,
    pub seed_index: u64,
}

impl GenerationEngine {
    pub fn new(
        inference: Arc<dyn InferenceService>,
        pricing: PricingConfig,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            inference,
            pricing,
            default_model: default_model.into(),
        }
    }

    /// Execute the template's steps in order for one seed.
    ///
    /// Every completed inference call is accrued on `ledger`, including calls
    /// made for a record that later fails.
    pub async fn generate_record(
        &self,
        template: &Template,
        input: RecordInput<'_>,
        ledger: &BudgetLedger,
    ) -> Result<GeneratedRecord, InferenceError> {
        let mut outputs: Vec<StepOutput> = Vec::with_capacity(template.steps.len());
        let mut tokens = 0u64;

        for step in &template.steps {
            let text = match step {
                StepSpec::Generate { model, prompt, .. } => {
                    self.invoke(model.as_deref(), prompt, &input, &outputs, ledger, &mut tokens)
                        .await?
                }
                StepSpec::Classify {
                    model,
                    prompt,
                    labels,
                    ..
                } => {
                    let raw = self
                        .invoke(model.as_deref(), prompt, &input, &outputs, ledger, &mut tokens)
                        .await?;
                    match_label(&raw, labels)?
                }
                StepSpec::Transform { source, op, .. } => {
                    let source_text = outputs
                        .iter()
                        .find(|o| &o.step_id == source)
                        .map(|o| o.text.as_str())
                        .ok_or_else(|| {
                            InferenceError::ValidationError(format!(
                                "transform source '{}' has no output",
                                source
                            ))
                        })?;
                    op.apply(source_text)
                }
            };
            trace!(seed_index = input.seed_index, step_id = step.id(), "Step completed");
            outputs.push(StepOutput {
                step_id: step.id().to_string(),
                text,
            });
        }

        Ok(GeneratedRecord {
            record_id: record_id(input.job_id, input.seed_index),
            seed_index: input.seed_index,
            seed: input.seed.clone(),
            outputs,
            tokens,
        })
    }

    async fn invoke(
        &self,
        model: Option<&str>,
        prompt: &str,
        input: &RecordInput<'_>,
        prior: &[StepOutput],
        ledger: &BudgetLedger,
        tokens: &mut u64,
    ) -> Result<String, InferenceError> {
        let rendered = render_prompt(prompt, input.seed, input.seed_index, prior)?;
        let model_id = model.unwrap_or(&self.default_model);
        let output = self.inference.invoke(model_id, &rendered).await?;
        let cost = self.pricing.invocation_cost(&rendered, &output);
        ledger.accrue(cost);
        *tokens += cost.input_tokens + cost.output_tokens;
        Ok(output)
    }
}
