use futures::future::BoxFuture;
use serde_json::Value;

use flowrun_core::error::FlowError;
use flowrun_core::types::Variables;

use super::condition::evaluate_predicate;
use super::{NextSteps, StepContext, StepHandler, StepOutcome};

/// Loops back to an earlier step until `until` holds or the step's
/// `retry_count` loop budget is spent.
pub struct FeedbackHandler;

impl StepHandler for FeedbackHandler {
    fn run(&self, ctx: StepContext) -> BoxFuture<'_, StepOutcome> {
        Box::pin(async move {
            let Some(target) = ctx.param_str("target").map(str::to_string) else {
                return StepOutcome::fatal(format!(
                    "Feedback step '{}' has no target",
                    ctx.step.id
                ));
            };

            let satisfied = ctx
                .param("until")
                .is_some_and(|until| evaluate_predicate(until, &ctx.variables));
            if satisfied {
                return StepOutcome::succeeded(Variables::new());
            }

            let iterations = ctx.state.iterations;
            if iterations >= ctx.step.retry_count {
                return StepOutcome::fatal(
                    FlowError::StepRetryExhausted {
                        step: ctx.step.id.clone(),
                        attempts: iterations,
                        reason: format!("loop back to '{}' did not satisfy its exit condition", target),
                    }
                    .to_string(),
                );
            }

            let patch = match ctx.param("variables") {
                Some(Value::Object(map)) => map.clone(),
                _ => Variables::new(),
            };
            StepOutcome::Succeeded {
                patch,
                next: NextSteps::LoopBack { target },
            }
        })
    }
}
