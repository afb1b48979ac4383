use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::providers::{LlmAdapter, PlanRequest};
use crate::schema::validate_plan;
use crate::types::{Plan, RunContext};

/// Drives the model to a schema-valid Plan, retrying validation failures.
/// Temperature stays near zero to bias the model toward deterministic output.
pub struct Planner {
    temperature: f32,
    max_retries: u32,
}

impl Planner {
    pub fn new(temperature: f32, max_retries: u32) -> Self {
        Self {
            temperature,
            max_retries,
        }
    }

    pub async fn plan(
        &self,
        adapter: &dyn LlmAdapter,
        ctx: &RunContext,
        allowed_tools: &[String],
        system_context: &str,
        cancel: &CancellationToken,
    ) -> Result<Plan, CoreError> {
        let attempts = self.max_retries + 1;
        let mut issues = Vec::new();
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let request = PlanRequest {
                user_message: ctx.user_message.clone(),
                system_context: system_context.to_string(),
                allowed_tools: allowed_tools.to_vec(),
                temperature: self.temperature,
            };
            let raw = tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                raw = adapter.generate_plan(request) => raw,
            };
            match raw {
                Ok(value) => match validate_plan(&value) {
                    Ok(plan) => return Ok(plan),
                    Err(validation_issues) => {
                        tracing::debug!(
                            attempt,
                            "planner output failed validation: {}",
                            validation_issues.join("; ")
                        );
                        issues = validation_issues;
                    }
                },
                Err(e) => {
                    tracing::debug!(attempt, "planner adapter call failed: {e}");
                    issues = vec![format!("adapter error: {e}")];
                }
            }
        }
        Err(CoreError::Planner { attempts, issues })
    }
}
