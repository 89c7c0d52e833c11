//! Per-execution scheduling loop.
//!
//! One [`Scheduler`] owns one execution. It is the only writer of that
//! execution's events: step attempts run as tasks in its `JoinSet` and
//! report back, and every state change goes through the event bus first and
//! is then folded into the local [`Execution`] with [`Execution::apply`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowrun_core::config::EngineConfig;
use flowrun_core::error::FlowError;
use flowrun_core::event::{EventBus, EventKind};
use flowrun_core::graph::{Flow, GraphIndex};
use flowrun_core::template;
use flowrun_core::traits::ExecutionStore;
use flowrun_core::types::{Execution, ExecutionId, StepStatus, Variables};

use crate::approval::{ApprovalBroker, ApprovalDecision};
use crate::handlers::{HandlerSet, NextSteps, StepContext, StepOutcome};

/// Shared services every scheduler runs against.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub config: EngineConfig,
    pub handlers: Arc<HandlerSet>,
    pub bus: Arc<EventBus>,
    pub approvals: Arc<ApprovalBroker>,
    pub store: Option<Arc<dyn ExecutionStore>>,
}

/// What a task in the execution's `JoinSet` reports.
enum TaskResult {
    Attempt {
        step_id: String,
        attempt: u32,
        outcome: StepOutcome,
    },
    RetryDue {
        step_id: String,
        attempt: u32,
    },
    Decision {
        step_id: String,
        decision: Option<ApprovalDecision>,
    },
}

pub struct Scheduler {
    deps: SchedulerDeps,
    flow: Arc<Flow>,
    index: GraphIndex,
    execution: Execution,
    initial_variables: Variables,
    /// Pending steps some predecessor has selected.
    activated: HashSet<String>,
    /// Steps whose approval was rejected, with the failure reason.
    halted: Vec<(String, String)>,
    tasks: JoinSet<TaskResult>,
    /// Fired by the caller.
    cancel: CancellationToken,
    /// Fired when the execution stops; parent of every attempt token.
    abort: CancellationToken,
    snapshot: watch::Sender<Execution>,
}

impl Scheduler {
    pub fn new(
        deps: SchedulerDeps,
        flow: Arc<Flow>,
        id: ExecutionId,
        variables: Variables,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<Execution>) {
        let execution = Execution::new(id, &flow);
        let (snapshot, rx) = watch::channel(execution.clone());
        let abort = cancel.child_token();
        let scheduler = Self {
            deps,
            index: GraphIndex::build(&flow),
            flow,
            execution,
            initial_variables: variables,
            activated: HashSet::new(),
            halted: Vec::new(),
            tasks: JoinSet::new(),
            cancel,
            abort,
            snapshot,
        };
        (scheduler, rx)
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution.id
    }

    /// Record the start of the execution and activate the start step.
    pub async fn start(&mut self) {
        let variables = std::mem::take(&mut self.initial_variables);
        self.emit(EventKind::ExecutionStarted {
            flow_id: self.flow.id.clone(),
            variables,
            steps: self.index.order().to_vec(),
        })
        .await;
        self.activated.insert(self.flow.start.clone());
        info!(
            execution_id = %self.execution.id,
            flow_id = %self.flow.id,
            steps = self.flow.steps.len(),
            "Execution started"
        );
    }

    /// Drive the execution to a terminal state and return it.
    pub async fn run(mut self) -> Execution {
        if self.execution.status.is_terminal() {
            return self.execution;
        }
        if self.execution.last_seq == 0 {
            self.start().await;
        }
        self.advance().await;

        loop {
            if self.execution.status.is_terminal() {
                break;
            }
            if self.cancel.is_cancelled() {
                self.cancelled().await;
                break;
            }
            if self.tasks.is_empty() {
                self.finish().await;
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                joined = self.tasks.join_next() => joined,
            };

            match joined {
                None => continue,
                Some(Ok(result)) => self.handle(result).await,
                Some(Err(e)) => {
                    error!(execution_id = %self.execution.id, error = %e, "Step task aborted");
                    self.fail(None, format!("Step task aborted: {}", e)).await;
                }
            }

            if !self.execution.status.is_terminal() {
                self.advance().await;
            }
        }

        self.tasks.abort_all();
        self.execution
    }

    async fn emit(&mut self, kind: EventKind) {
        let event = self.deps.bus.append(&self.execution.id, kind).await;
        self.execution.apply(&event);

        // Observers that see a terminal snapshot can rely on the stored copy.
        if let Some(store) = &self.deps.store {
            if let Err(e) = store.save_execution(&self.execution).await {
                warn!(execution_id = %self.execution.id, error = %e, "Failed to persist execution state");
            }
        }
        self.snapshot.send_replace(self.execution.clone());
    }

    fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.execution.step_status(step_id)
    }

    fn predecessors_terminal(&self, step_id: &str) -> bool {
        self.index
            .predecessors(step_id)
            .all(|p| self.status(p).is_some_and(|s| s.is_terminal()))
    }

    /// A predecessor failed without being allowed to continue, e.g. a
    /// rejected approval gate.
    fn has_halted_predecessor(&self, step_id: &str) -> bool {
        self.index.predecessors(step_id).any(|p| {
            self.status(p) == Some(StepStatus::Failed)
                && !self.flow.step(p).is_some_and(|step| step.best_effort)
        })
    }

    /// First pending step whose predecessors are all done and that either
    /// nobody activated or sits behind a halted branch.
    fn next_skippable(&self) -> Option<String> {
        self.index
            .order()
            .iter()
            .find(|id| {
                self.status(id) == Some(StepStatus::Pending)
                    && self.index.predecessors(id).next().is_some()
                    && self.predecessors_terminal(id)
                    && (!self.activated.contains(*id) || self.has_halted_predecessor(id))
            })
            .cloned()
    }

    fn ready_steps(&self) -> Vec<String> {
        self.index
            .order()
            .iter()
            .filter(|id| {
                self.status(id) == Some(StepStatus::Pending)
                    && self.activated.contains(*id)
                    && self.predecessors_terminal(id)
            })
            .cloned()
            .collect()
    }

    /// Apply the skip cascade, then dispatch every ready step.
    async fn advance(&mut self) {
        while let Some(step_id) = self.next_skippable() {
            debug!(execution_id = %self.execution.id, step_id = %step_id, "Skipping step");
            self.activated.remove(&step_id);
            self.emit(EventKind::StepSkipped { step_id }).await;
        }

        for step_id in self.ready_steps() {
            if self.cancel.is_cancelled() {
                return;
            }
            self.dispatch(&step_id, 1).await;
        }
    }

    async fn dispatch(&mut self, step_id: &str, attempt: u32) {
        let Some(step) = self.flow.step(step_id).cloned() else {
            warn!(execution_id = %self.execution.id, step_id = %step_id, "Dispatch of unknown step");
            return;
        };

        let rendered = template::render(&Value::Object(step.params.clone()), &self.execution.variables);
        if !rendered.unresolved.is_empty() {
            warn!(
                execution_id = %self.execution.id,
                step_id = %step_id,
                unresolved = ?rendered.unresolved,
                "Unresolved template placeholders"
            );
            self.emit(EventKind::VariablesUpdated {
                step_id: Some(step_id.to_string()),
                patch: Variables::new(),
                unresolved: rendered.unresolved,
            })
            .await;
        }
        let params = match rendered.value {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        self.emit(EventKind::StepStarted {
            step_id: step_id.to_string(),
            attempt,
        })
        .await;
        debug!(
            execution_id = %self.execution.id,
            step_id = %step_id,
            kind = %step.kind,
            attempt,
            "Dispatching step"
        );

        let timeout_secs = step
            .timeout_secs
            .unwrap_or(self.deps.config.default_step_timeout_secs);
        let ctx = StepContext {
            execution_id: self.execution.id.clone(),
            state: self.execution.steps.get(step_id).cloned().unwrap_or_default(),
            variables: self.execution.variables.clone(),
            params,
            step,
        };
        let handlers = self.deps.handlers.clone();
        let token = self.abort.child_token();
        let step_id = step_id.to_string();

        self.tasks.spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => StepOutcome::fatal(FlowError::CancelledByCaller.to_string()),
                result = tokio::time::timeout(Duration::from_secs(timeout_secs), handlers.run(ctx)) => {
                    match result {
                        Ok(outcome) => outcome,
                        Err(_) => StepOutcome::Failed {
                            reason: FlowError::StepTimeout {
                                step: step_id.clone(),
                                timeout_secs,
                            }
                            .to_string(),
                            retryable: true,
                        },
                    }
                }
            };
            TaskResult::Attempt {
                step_id,
                attempt,
                outcome,
            }
        });
    }

    async fn handle(&mut self, result: TaskResult) {
        match result {
            TaskResult::Attempt {
                step_id,
                attempt,
                outcome,
            } => {
                if self.status(&step_id) != Some(StepStatus::Running) {
                    debug!(execution_id = %self.execution.id, step_id = %step_id, "Discarding stale outcome");
                    return;
                }
                self.on_outcome(step_id, attempt, outcome).await;
            }
            TaskResult::RetryDue { step_id, attempt } => {
                if !self.cancel.is_cancelled() {
                    self.dispatch(&step_id, attempt).await;
                }
            }
            TaskResult::Decision { step_id, decision } => {
                self.on_decision(step_id, decision).await;
            }
        }
    }

    async fn on_outcome(&mut self, step_id: String, attempt: u32, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Succeeded { patch, next } => {
                let targets = match next {
                    NextSteps::LoopBack { target } => {
                        self.loop_back(step_id, target, patch).await;
                        return;
                    }
                    NextSteps::All => self.index.successors(&step_id).to_vec(),
                    NextSteps::Only(ids) => ids,
                };
                debug!(
                    execution_id = %self.execution.id,
                    step_id = %step_id,
                    activated = ?targets,
                    "Step succeeded"
                );
                self.emit(EventKind::StepCompleted {
                    step_id: step_id.clone(),
                    outputs: patch,
                    activated: targets.clone(),
                })
                .await;
                self.activate(&step_id, &targets).await;
            }
            StepOutcome::Failed { reason, retryable } => {
                self.on_failure(step_id, attempt, reason, retryable).await;
            }
            StepOutcome::Suspended { reason } => {
                // Register before announcing so a client reacting to the
                // event always finds the request.
                let rx = self
                    .deps
                    .approvals
                    .request(&self.execution.id, &step_id, &reason)
                    .await;
                info!(execution_id = %self.execution.id, step_id = %step_id, "Awaiting approval");
                self.emit(EventKind::ApprovalRequested {
                    step_id: step_id.clone(),
                    message: reason,
                })
                .await;
                self.tasks.spawn(async move {
                    TaskResult::Decision {
                        step_id,
                        decision: rx.await.ok(),
                    }
                });
            }
        }
    }

    async fn activate(&mut self, from: &str, targets: &[String]) {
        for to in targets {
            match self.status(to) {
                Some(StepStatus::Pending) => {
                    self.activated.insert(to.clone());
                }
                Some(status) => {
                    warn!(
                        execution_id = %self.execution.id,
                        from = %from,
                        step_id = %to,
                        status = %status,
                        "Rejected re-entry into step"
                    );
                    self.emit(EventKind::ReentryRejected {
                        from: from.to_string(),
                        step_id: to.clone(),
                    })
                    .await;
                }
                None => {
                    warn!(execution_id = %self.execution.id, step_id = %to, "Activation of unknown step");
                }
            }
        }
    }

    async fn loop_back(&mut self, step_id: String, target: String, patch: Variables) {
        let iteration = self
            .execution
            .steps
            .get(&step_id)
            .map(|s| s.iterations)
            .unwrap_or(0)
            + 1;
        let reset = self.index.loop_body(&target, &step_id);
        for id in &reset {
            self.activated.remove(id);
        }
        info!(
            execution_id = %self.execution.id,
            step_id = %step_id,
            target = %target,
            iteration,
            "Feedback loop"
        );
        self.emit(EventKind::FeedbackLooped {
            step_id,
            target: target.clone(),
            iteration,
            reset,
            patch,
        })
        .await;
        self.activated.insert(target);
    }

    async fn on_failure(&mut self, step_id: String, attempt: u32, reason: String, retryable: bool) {
        let (retry_count, best_effort) = match self.flow.step(&step_id) {
            Some(step) => (step.retry_count, step.best_effort),
            None => (0, false),
        };
        let policy = self.deps.config.step_backoff(retry_count);

        if retryable && policy.allows(attempt) {
            let delay = policy.delay_for(attempt);
            warn!(
                execution_id = %self.execution.id,
                step_id = %step_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Step failed, retrying"
            );
            self.emit(EventKind::StepRetrying {
                step_id: step_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                reason,
            })
            .await;
            let next = attempt + 1;
            self.tasks.spawn(async move {
                tokio::time::sleep(delay).await;
                TaskResult::RetryDue {
                    step_id,
                    attempt: next,
                }
            });
            return;
        }

        let reason = if retryable && retry_count > 0 {
            FlowError::StepRetryExhausted {
                step: step_id.clone(),
                attempts: attempt,
                reason,
            }
            .to_string()
        } else {
            reason
        };
        self.emit(EventKind::StepFailed {
            step_id: step_id.clone(),
            reason: reason.clone(),
            attempts: attempt,
        })
        .await;

        if best_effort {
            warn!(
                execution_id = %self.execution.id,
                step_id = %step_id,
                error = %reason,
                "Best-effort step failed, continuing"
            );
            let targets = self.index.successors(&step_id).to_vec();
            self.activate(&step_id, &targets).await;
        } else {
            error!(execution_id = %self.execution.id, step_id = %step_id, error = %reason, "Step failed");
            self.fail(Some(step_id), reason).await;
        }
    }

    async fn on_decision(&mut self, step_id: String, decision: Option<ApprovalDecision>) {
        let reason = match decision {
            Some(ApprovalDecision::Approved) => {
                info!(execution_id = %self.execution.id, step_id = %step_id, "Approval granted");
                self.emit(EventKind::ApprovalResolved {
                    step_id: step_id.clone(),
                    approved: true,
                    reason: None,
                })
                .await;
                let targets = self.index.successors(&step_id).to_vec();
                self.emit(EventKind::StepCompleted {
                    step_id: step_id.clone(),
                    outputs: Variables::new(),
                    activated: targets.clone(),
                })
                .await;
                self.activate(&step_id, &targets).await;
                return;
            }
            Some(ApprovalDecision::Rejected { reason }) => reason,
            None => "approval request was withdrawn".to_string(),
        };

        warn!(execution_id = %self.execution.id, step_id = %step_id, reason = %reason, "Approval rejected");
        self.emit(EventKind::ApprovalResolved {
            step_id: step_id.clone(),
            approved: false,
            reason: Some(reason.clone()),
        })
        .await;
        let error = FlowError::ApprovalRejected {
            step: step_id.clone(),
            reason,
        }
        .to_string();
        let attempts = self
            .execution
            .steps
            .get(&step_id)
            .map(|s| s.attempts)
            .unwrap_or(1);
        self.emit(EventKind::StepFailed {
            step_id: step_id.clone(),
            reason: error.clone(),
            attempts,
        })
        .await;
        self.halted.push((step_id, error));
    }

    /// Stop everything in flight and end the execution as failed.
    async fn fail(&mut self, step_id: Option<String>, reason: String) {
        self.abort.cancel();
        self.tasks.abort_all();
        self.deps.approvals.discard(&self.execution.id).await;
        self.emit(EventKind::ExecutionFailed { reason, step_id }).await;
    }

    async fn cancelled(&mut self) {
        self.abort.cancel();
        self.tasks.abort_all();
        self.deps.approvals.discard(&self.execution.id).await;
        info!(execution_id = %self.execution.id, "Execution cancelled");
        self.emit(EventKind::ExecutionCancelled {
            reason: FlowError::CancelledByCaller.to_string(),
        })
        .await;
    }

    /// Nothing left to run: complete, unless a branch was halted.
    async fn finish(&mut self) {
        if let Some((step_id, reason)) = self.halted.first().cloned() {
            error!(execution_id = %self.execution.id, step_id = %step_id, "Execution failed after draining");
            self.emit(EventKind::ExecutionFailed {
                reason,
                step_id: Some(step_id),
            })
            .await;
            return;
        }

        info!(execution_id = %self.execution.id, flow_id = %self.flow.id, "Execution completed");
        let variables = self.execution.variables.clone();
        self.emit(EventKind::ExecutionCompleted { variables }).await;
    }
}
