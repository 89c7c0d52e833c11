pub mod approval;
pub mod catalog;
pub mod engine;
pub mod handlers;
pub mod scheduler;

pub use approval::{ApprovalBroker, ApprovalDecision, PendingApproval};
pub use catalog::FlowCatalog;
pub use engine::FlowEngine;
pub use handlers::{HandlerSet, NextSteps, StepContext, StepHandler, StepOutcome};
pub use scheduler::{Scheduler, SchedulerDeps};
