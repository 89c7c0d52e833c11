use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use flowrun_core::traits::AgentProvider;
use flowrun_core::types::{AgentRequest, Variables};

use super::{StepContext, StepHandler, StepOutcome};

/// Runs a task through a configured agent binding.
pub struct AgentHandler {
    agents: Arc<dyn AgentProvider>,
}

impl AgentHandler {
    pub fn new(agents: Arc<dyn AgentProvider>) -> Self {
        Self { agents }
    }
}

impl StepHandler for AgentHandler {
    fn run(&self, ctx: StepContext) -> BoxFuture<'_, StepOutcome> {
        Box::pin(async move {
            let binding = ctx.param_str("agent").unwrap_or("default").to_string();
            let task = match ctx.param("task") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    return StepOutcome::fatal(format!(
                        "Agent step '{}' has no task",
                        ctx.step.id
                    ))
                }
            };
            let system_prompt = ctx.param_str("system_prompt").map(str::to_string);

            debug!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step.id,
                binding = %binding,
                "Running agent step"
            );

            let reply = match self
                .agents
                .complete(AgentRequest {
                    binding,
                    system_prompt,
                    task,
                })
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    return StepOutcome::Failed {
                        retryable: e.is_retryable(),
                        reason: e.to_string(),
                    }
                }
            };

            let mut patch = Variables::new();
            ingest_outputs(&mut patch, &ctx, &reply);
            patch.insert(ctx.output_key(), Value::String(reply));
            StepOutcome::succeeded(patch)
        })
    }
}

/// Copy the keys listed in `outputs` out of a JSON reply. A reply that is
/// not a JSON object is stored whole under each key.
fn ingest_outputs(patch: &mut Variables, ctx: &StepContext, reply: &str) {
    let keys: Vec<&str> = match ctx.param("outputs") {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        Some(Value::String(s)) => vec![s.as_str()],
        _ => return,
    };
    if keys.is_empty() {
        return;
    }

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(reply) {
        for key in keys {
            if let Some(val) = obj.get(key) {
                patch.insert(key.to_string(), val.clone());
            }
        }
        return;
    }

    for key in keys {
        patch.insert(key.to_string(), Value::String(reply.to_string()));
    }
}
