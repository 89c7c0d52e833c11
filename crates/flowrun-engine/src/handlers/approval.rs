use futures::future::BoxFuture;

use super::{StepContext, StepHandler, StepOutcome};

/// Suspends the step until a human decision arrives.
pub struct ApprovalHandler;

impl StepHandler for ApprovalHandler {
    fn run(&self, ctx: StepContext) -> BoxFuture<'_, StepOutcome> {
        Box::pin(async move {
            let reason = ctx
                .param_str("message")
                .map(str::to_string)
                .unwrap_or_else(|| format!("Approval required for step '{}'", ctx.step.display_name()));
            StepOutcome::Suspended { reason }
        })
    }
}
