//! One executor per step kind.

mod agent;
mod approval;
mod condition;
mod feedback;
mod parallel;
mod tool;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use flowrun_core::config::ToolServerConfig;
use flowrun_core::graph::{Step, StepKind};
use flowrun_core::traits::AgentProvider;
use flowrun_core::types::{ExecutionId, StepState, Variables};
use flowrun_mcp::ToolSessionManager;

pub use agent::AgentHandler;
pub use approval::ApprovalHandler;
pub use condition::{evaluate_comparison, evaluate_predicate, ConditionHandler};
pub use feedback::FeedbackHandler;
pub use parallel::ParallelHandler;
pub use tool::ToolHandler;

/// Everything a handler sees for one attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub step: Step,
    /// Step parameters with `${..}` placeholders already substituted.
    pub params: serde_json::Map<String, Value>,
    /// Snapshot of the execution variables at dispatch time.
    pub variables: Variables,
    /// The step's bookkeeping at dispatch time.
    pub state: StepState,
}

impl StepContext {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Variable key the step writes its result under.
    pub fn output_key(&self) -> String {
        self.param_str("output")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_output", self.step.id))
    }
}

/// Which successors a succeeded step activates.
#[derive(Debug, Clone, PartialEq)]
pub enum NextSteps {
    /// Every id in `next_steps`.
    All,
    /// Only these successors; the rest are skipped.
    Only(Vec<String>),
    /// Jump back to an earlier step (feedback loops).
    LoopBack { target: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded { patch: Variables, next: NextSteps },
    Failed { reason: String, retryable: bool },
    /// Waiting on an external decision.
    Suspended { reason: String },
}

impl StepOutcome {
    pub fn succeeded(patch: Variables) -> Self {
        Self::Succeeded {
            patch,
            next: NextSteps::All,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            retryable: false,
        }
    }
}

pub trait StepHandler: Send + Sync {
    fn run(&self, ctx: StepContext) -> BoxFuture<'_, StepOutcome>;
}

/// The closed mapping from step kind to executor.
pub struct HandlerSet {
    agent: AgentHandler,
    tool: ToolHandler,
    condition: ConditionHandler,
    parallel: ParallelHandler,
    approval: ApprovalHandler,
    feedback: FeedbackHandler,
}

impl HandlerSet {
    pub fn new(
        agents: Arc<dyn AgentProvider>,
        sessions: Arc<ToolSessionManager>,
        tool_servers: BTreeMap<String, ToolServerConfig>,
    ) -> Self {
        Self {
            agent: AgentHandler::new(agents),
            tool: ToolHandler::new(sessions, tool_servers),
            condition: ConditionHandler,
            parallel: ParallelHandler,
            approval: ApprovalHandler,
            feedback: FeedbackHandler,
        }
    }

    pub fn handler(&self, kind: StepKind) -> &dyn StepHandler {
        match kind {
            StepKind::Agent => &self.agent,
            StepKind::Tool => &self.tool,
            StepKind::Condition => &self.condition,
            StepKind::Parallel => &self.parallel,
            StepKind::Approval => &self.approval,
            StepKind::Feedback => &self.feedback,
        }
    }

    pub async fn run(&self, ctx: StepContext) -> StepOutcome {
        self.handler(ctx.step.kind).run(ctx).await
    }
}
