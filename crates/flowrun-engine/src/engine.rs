use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowrun_core::config::{AppConfig, EngineConfig};
use flowrun_core::error::{FlowError, Result};
use flowrun_core::event::{Event, EventBus};
use flowrun_core::graph::{validate, Flow};
use flowrun_core::traits::{AgentProvider, ExecutionStore, FlowSource};
use flowrun_core::types::{
    Execution, ExecutionId, ExecutionStatus, ExecutionSummary, FlowSummary, Variables,
};
use flowrun_mcp::ToolSessionManager;

use crate::approval::{ApprovalBroker, ApprovalDecision, PendingApproval};
use crate::handlers::HandlerSet;
use crate::scheduler::{Scheduler, SchedulerDeps};

struct RunHandle {
    cancel: CancellationToken,
    state: watch::Receiver<Execution>,
}

/// Entry point for submitting, observing and steering executions.
pub struct FlowEngine {
    deps: SchedulerDeps,
    flows: Arc<dyn FlowSource>,
    runs: Arc<RwLock<HashMap<ExecutionId, RunHandle>>>,
    shutdown: CancellationToken,
}

impl FlowEngine {
    pub fn new(config: EngineConfig, flows: Arc<dyn FlowSource>, handlers: HandlerSet) -> Self {
        let bus = Arc::new(EventBus::new(config.event_buffer));
        Self {
            deps: SchedulerDeps {
                config,
                handlers: Arc::new(handlers),
                bus,
                approvals: Arc::new(ApprovalBroker::new()),
                store: None,
            },
            flows,
            runs: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build an engine wired to the configured tool servers and agents.
    pub fn from_config(
        config: &AppConfig,
        flows: Arc<dyn FlowSource>,
        agents: Arc<dyn AgentProvider>,
        sessions: Arc<ToolSessionManager>,
    ) -> Self {
        let handlers = HandlerSet::new(agents, sessions, config.tool_servers.clone());
        Self::new(config.engine.clone(), flows, handlers)
    }

    /// Persist executions and events to `store`.
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.deps.bus = Arc::new(EventBus::new(self.deps.config.event_buffer).with_store(store.clone()));
        self.deps.store = Some(store);
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.deps.bus.clone()
    }

    pub async fn flows(&self) -> Result<Vec<FlowSummary>> {
        self.flows.list_flows().await
    }

    /// Start an execution of a catalogued flow.
    pub async fn submit(&self, flow_id: &str, overrides: Variables) -> Result<ExecutionSummary> {
        let flow = self
            .flows
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.to_string()))?;
        self.submit_flow(flow, overrides).await
    }

    /// Start an execution of `flow`. A flow that fails validation is
    /// rejected before any execution exists.
    pub async fn submit_flow(&self, flow: Flow, overrides: Variables) -> Result<ExecutionSummary> {
        validate(&flow)?;

        let (variables, undeclared) = flow.bind_variables(&overrides);
        if !undeclared.is_empty() {
            warn!(flow_id = %flow.id, undeclared = ?undeclared, "Variables not declared by the flow");
        }

        let id = ExecutionId::new();
        let cancel = self.shutdown.child_token();
        let (mut scheduler, state) = Scheduler::new(
            self.deps.clone(),
            Arc::new(flow),
            id.clone(),
            variables,
            cancel.clone(),
        );
        scheduler.start().await;
        let summary = state.borrow().summary();

        self.runs
            .write()
            .await
            .insert(id.clone(), RunHandle { cancel, state });

        let runs = self.runs.clone();
        let bus = self.deps.bus.clone();
        let stored = self.deps.store.is_some();
        tokio::spawn(async move {
            let execution = scheduler.run().await;
            // Terminal state and events are persisted by now; serve them
            // from the store from here on.
            if stored && execution.status.is_terminal() {
                bus.evict(&execution.id).await;
                runs.write().await.remove(&execution.id);
                debug!(execution_id = %execution.id, "Evicted finished execution");
            }
        });
        Ok(summary)
    }

    fn snapshot(handle: &RunHandle) -> Execution {
        handle.state.borrow().clone()
    }

    /// Current state of an execution, live or stored.
    pub async fn execution(&self, id: &ExecutionId) -> Result<Execution> {
        if let Some(handle) = self.runs.read().await.get(id) {
            return Ok(Self::snapshot(handle));
        }
        if let Some(store) = &self.deps.store {
            if let Some(execution) = store.load_execution(id).await? {
                return Ok(execution);
            }
        }
        Err(FlowError::ExecutionNotFound(id.to_string()))
    }

    /// Most recent executions first.
    pub async fn list(&self, limit: usize) -> Result<Vec<ExecutionSummary>> {
        if let Some(store) = &self.deps.store {
            return store.list_executions(limit).await;
        }
        let mut all: Vec<ExecutionSummary> = self
            .runs
            .read()
            .await
            .values()
            .map(|h| Self::snapshot(h).summary())
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        Ok(all)
    }

    /// Wait until the execution reaches a terminal state.
    pub async fn wait(&self, id: &ExecutionId) -> Result<Execution> {
        let rx = self.runs.read().await.get(id).map(|h| h.state.clone());
        let Some(mut rx) = rx else {
            return self.execution(id).await;
        };
        let done = rx
            .wait_for(|e| e.status.is_terminal())
            .await
            .map(|e| Execution::clone(&e));
        Ok(match done {
            Ok(execution) => execution,
            Err(_) => rx.borrow().clone(),
        })
    }

    /// Request cancellation and wait for it to take effect. Cancelling a
    /// terminal execution is a no-op that reports its status.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<ExecutionStatus> {
        let resident = self
            .runs
            .read()
            .await
            .get(id)
            .map(|h| (h.state.borrow().status, h.cancel.clone()));
        let token = match resident {
            Some((status, _)) if status.is_terminal() => return Ok(status),
            Some((_, token)) => token,
            None => return Ok(self.execution(id).await?.status),
        };
        info!(execution_id = %id, "Cancellation requested");
        token.cancel();
        Ok(self.wait(id).await?.status)
    }

    /// Deliver an approval decision. Targets `step_id` when given, otherwise
    /// the step that has been waiting longest. Returns the resolved step.
    pub async fn submit_approval(
        &self,
        id: &ExecutionId,
        approved: bool,
        reason: Option<String>,
        step_id: Option<&str>,
    ) -> Result<String> {
        let execution = self.execution(id).await?;
        if execution.status.is_terminal() {
            return Err(FlowError::NoPendingApproval(id.to_string()));
        }
        let decision = if approved {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Rejected {
                reason: reason.unwrap_or_else(|| "rejected".to_string()),
            }
        };
        let resolved = self
            .deps
            .approvals
            .respond(id, step_id, decision)
            .await
            .ok_or_else(|| FlowError::NoPendingApproval(id.to_string()))?;
        info!(execution_id = %id, step_id = %resolved, approved, "Approval decision delivered");
        Ok(resolved)
    }

    pub async fn pending_approvals(&self, id: &ExecutionId) -> Vec<PendingApproval> {
        self.deps.approvals.pending(id).await
    }

    /// Events after `from_seq`, live until the terminal event.
    pub async fn subscribe(
        &self,
        id: &ExecutionId,
        from_seq: u64,
    ) -> Result<BoxStream<'static, Event>> {
        self.deps.bus.subscribe(id, from_seq).await
    }

    /// Events recorded so far after `from_seq`.
    pub async fn events(&self, id: &ExecutionId, from_seq: u64) -> Result<Vec<Event>> {
        self.deps.bus.events(id, from_seq).await
    }

    /// Cancel every running execution and wait for them to stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<ExecutionId> = self.runs.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.wait(&id).await;
        }
        info!("Flow engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;

    use flowrun_core::event::EventKind;
    use flowrun_core::graph::{Step, StepKind};
    use flowrun_core::types::StepStatus;
    use flowrun_store::MemoryStore;
    use flowrun_test_utils::{
        approval_step, condition_step, fan_out_flow, feedback_step, linear_flow, parallel_step,
        test_config, tool_step, vars, MockAgent, MockBehavior, MockToolConnector,
    };

    use crate::catalog::FlowCatalog;

    fn engine(connector: &MockToolConnector, flows: Vec<Flow>) -> FlowEngine {
        engine_with_agent(connector, MockAgent::new(), flows)
    }

    fn engine_with_agent(connector: &MockToolConnector, agent: MockAgent, flows: Vec<Flow>) -> FlowEngine {
        let config = test_config();
        let sessions = Arc::new(ToolSessionManager::new(
            Arc::new(connector.clone()),
            config.sessions.clone(),
        ));
        FlowEngine::from_config(
            &config,
            Arc::new(FlowCatalog::from_flows(flows)),
            Arc::new(agent),
            sessions,
        )
    }

    fn echo() -> MockToolConnector {
        MockToolConnector::new().with_tool("echo", MockBehavior::Echo)
    }

    async fn kinds(engine: &FlowEngine, id: &ExecutionId) -> Vec<EventKind> {
        engine
            .events(id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }

    fn started(kinds: &[EventKind]) -> Vec<String> {
        kinds
            .iter()
            .filter_map(|k| match k {
                EventKind::StepStarted { step_id, .. } => Some(step_id.clone()),
                _ => None,
            })
            .collect()
    }

    async fn wait_for_event(
        engine: &FlowEngine,
        id: &ExecutionId,
        pred: impl Fn(&EventKind) -> bool,
    ) {
        let mut stream = engine.subscribe(id, 0).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = stream.next().await {
                if pred(&event.kind) {
                    return;
                }
            }
            panic!("stream ended before the expected event");
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_linear_flow_visits_each_step_once_in_order() {
        let engine = engine(&echo(), vec![linear_flow()]);
        let summary = engine.submit("linear", Variables::new()).await.unwrap();
        assert_eq!(summary.status, ExecutionStatus::Running);

        let done = engine.wait(&summary.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.variables["b_output"], json!({ "step": "b" }));

        let kinds = kinds(&engine, &summary.id).await;
        assert_eq!(started(&kinds), vec!["a", "b", "c"]);
        assert!(matches!(kinds.first(), Some(EventKind::ExecutionStarted { .. })));
        assert!(matches!(kinds.last(), Some(EventKind::ExecutionCompleted { .. })));
        assert_eq!(kinds.iter().filter(|k| k.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_condition_skips_unselected_branch() {
        let flow = Flow::new(
            "triage",
            "route",
            vec![
                condition_step(
                    "route",
                    r#"kind == "bug""#,
                    json!({ "true": "fix", "false": "file" }),
                )
                .with_next(["fix", "file"]),
                tool_step("fix", "echo").with_next(["close"]),
                tool_step("file", "echo").with_next(["close"]),
                tool_step("close", "echo"),
            ],
        );
        let engine = engine(&echo(), vec![flow]);
        let id = engine
            .submit("triage", vars(&[("kind", json!("bug"))]))
            .await
            .unwrap()
            .id;

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.step_status("file"), Some(StepStatus::Skipped));
        assert_eq!(done.step_status("fix"), Some(StepStatus::Succeeded));
        assert_eq!(done.step_status("close"), Some(StepStatus::Succeeded));
        assert_eq!(started(&kinds(&engine, &id).await), vec!["route", "fix", "close"]);
    }

    #[tokio::test]
    async fn test_join_waits_for_every_branch() {
        let connector = echo().with_tool("slow", MockBehavior::Sleep(Duration::from_millis(50)));
        let engine = engine(&connector, vec![fan_out_flow()]);
        let id = engine.submit("fan", Variables::new()).await.unwrap().id;
        assert_eq!(engine.wait(&id).await.unwrap().status, ExecutionStatus::Completed);

        let events = engine.events(&id, 0).await.unwrap();
        let seq_of = |pred: &dyn Fn(&EventKind) -> bool| {
            events.iter().find(|e| pred(&e.kind)).map(|e| e.seq).unwrap()
        };
        let join_started = seq_of(&|k| matches!(k, EventKind::StepStarted { step_id, .. } if step_id == "join"));
        let left_done = seq_of(&|k| matches!(k, EventKind::StepCompleted { step_id, .. } if step_id == "left"));
        let right_done = seq_of(&|k| matches!(k, EventKind::StepCompleted { step_id, .. } if step_id == "right"));
        assert!(join_started > left_done);
        assert!(join_started > right_done);
        assert_eq!(started(&kinds(&engine, &id).await).iter().filter(|s| *s == "join").count(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_then_single_terminal_event() {
        let connector = echo().with_tool("broken", MockBehavior::AlwaysFail("boom".into()));
        let flow = Flow::new(
            "retry",
            "a",
            vec![tool_step("a", "broken").with_retries(2).with_next(["b"]), tool_step("b", "echo")],
        );
        let engine = engine(&connector, vec![flow]);
        let id = engine.submit("retry", Variables::new()).await.unwrap().id;

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("exhausted its retry budget"));
        assert_eq!(connector.call_count("broken"), 3);

        let kinds = kinds(&engine, &id).await;
        assert_eq!(started(&kinds), vec!["a", "a", "a"]);
        assert_eq!(
            kinds.iter().filter(|k| matches!(k, EventKind::StepRetrying { .. })).count(),
            2
        );
        assert_eq!(
            kinds.iter().filter(|k| matches!(k, EventKind::StepFailed { .. })).count(),
            1
        );
        assert_eq!(kinds.iter().filter(|k| k.is_terminal()).count(), 1);
        assert!(matches!(
            kinds.last(),
            Some(EventKind::ExecutionFailed { step_id: Some(s), .. }) if s == "a"
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let connector = echo().with_tool("flaky", MockBehavior::FailTimes(1));
        let flow = Flow::new("flaky", "a", vec![tool_step("a", "flaky").with_retries(1)]);
        let engine = engine(&connector, vec![flow]);
        let id = engine.submit("flaky", Variables::new()).await.unwrap().id;

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.steps["a"].attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_fails_execution() {
        let connector = echo().with_tool("hang", MockBehavior::Sleep(Duration::from_secs(60)));
        let flow = Flow::new("hang", "a", vec![tool_step("a", "hang").with_timeout(1)]);
        let engine = engine(&connector, vec![flow]);
        let id = engine.submit("hang", Variables::new()).await.unwrap().id;

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_best_effort_failure_continues() {
        let connector = echo().with_tool("broken", MockBehavior::AlwaysFail("boom".into()));
        let flow = Flow::new(
            "lenient",
            "a",
            vec![
                tool_step("a", "broken").best_effort().with_next(["b"]),
                tool_step("b", "echo"),
            ],
        );
        let engine = engine(&connector, vec![flow]);
        let id = engine.submit("lenient", Variables::new()).await.unwrap().id;

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.step_status("a"), Some(StepStatus::Failed));
        assert_eq!(done.step_status("b"), Some(StepStatus::Succeeded));
    }

    fn approval_flow() -> Flow {
        Flow::new(
            "release",
            "fan",
            vec![
                parallel_step("fan").with_next(["gate", "notes"]),
                approval_step("gate", "Deploy ${version}?").with_next(["deploy"]),
                tool_step("deploy", "echo"),
                tool_step("notes", "echo"),
            ],
        )
        .with_variable("version", "1.0")
    }

    #[tokio::test]
    async fn test_approval_rejection_halts_branch() {
        let engine = engine(&echo(), vec![approval_flow()]);
        let id = engine.submit("release", Variables::new()).await.unwrap().id;

        wait_for_event(&engine, &id, |k| matches!(k, EventKind::ApprovalRequested { .. })).await;
        let waiting = engine.execution(&id).await.unwrap();
        assert_eq!(waiting.status, ExecutionStatus::Running);
        assert_eq!(waiting.step_status("gate"), Some(StepStatus::AwaitingApproval));
        let pending = engine.pending_approvals(&id).await;
        assert_eq!(pending[0].message, "Deploy 1.0?");

        let resolved = engine
            .submit_approval(&id, false, Some("not today".into()), None)
            .await
            .unwrap();
        assert_eq!(resolved, "gate");

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.step_status("gate"), Some(StepStatus::Failed));
        assert_eq!(done.step_status("deploy"), Some(StepStatus::Skipped));
        assert_eq!(done.step_status("notes"), Some(StepStatus::Succeeded));
        assert!(done.error.as_deref().unwrap().contains("not today"));
    }

    #[tokio::test]
    async fn test_rejected_gate_blocks_join() {
        let flow = Flow::new(
            "ship",
            "fan",
            vec![
                parallel_step("fan").with_next(["gate", "build"]),
                approval_step("gate", "Ship it?").with_next(["deploy"]),
                tool_step("build", "echo").with_next(["deploy"]),
                tool_step("deploy", "deployer").with_next(["announce"]),
                tool_step("announce", "echo"),
            ],
        );
        let connector = echo().with_tool("deployer", MockBehavior::Echo);
        let engine = engine(&connector, vec![flow]);
        let id = engine.submit("ship", Variables::new()).await.unwrap().id;

        wait_for_event(&engine, &id, |k| matches!(k, EventKind::ApprovalRequested { .. })).await;
        engine
            .submit_approval(&id, false, Some("freeze".into()), Some("gate"))
            .await
            .unwrap();

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.step_status("gate"), Some(StepStatus::Failed));
        assert_eq!(done.step_status("build"), Some(StepStatus::Succeeded));
        assert_eq!(done.step_status("deploy"), Some(StepStatus::Skipped));
        assert_eq!(done.step_status("announce"), Some(StepStatus::Skipped));
        assert_eq!(connector.call_count("deployer"), 0);
        assert!(!started(&kinds(&engine, &id).await).contains(&"deploy".to_string()));
    }

    #[tokio::test]
    async fn test_approval_grant_resumes() {
        let engine = engine(&echo(), vec![approval_flow()]);
        let id = engine.submit("release", Variables::new()).await.unwrap().id;

        wait_for_event(&engine, &id, |k| matches!(k, EventKind::ApprovalRequested { .. })).await;
        engine.submit_approval(&id, true, None, Some("gate")).await.unwrap();

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.step_status("deploy"), Some(StepStatus::Succeeded));

        let err = engine.submit_approval(&id, true, None, None).await.unwrap_err();
        assert!(matches!(err, FlowError::NoPendingApproval(_)));
    }

    #[tokio::test]
    async fn test_resubscribe_from_offset() {
        let engine = engine(&echo(), vec![linear_flow()]);
        let id = engine.submit("linear", Variables::new()).await.unwrap().id;
        engine.wait(&id).await.unwrap();

        let total = engine.events(&id, 0).await.unwrap().len() as u64;
        assert!(total > 5);
        let seqs: Vec<u64> = engine
            .subscribe(&id, 5)
            .await
            .unwrap()
            .map(|e| e.seq)
            .collect()
            .await;
        assert_eq!(seqs, (6..=total).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch_and_discards_late_outcomes() {
        let connector = echo().with_tool("slow", MockBehavior::Sleep(Duration::from_millis(200)));
        let flow = Flow::new(
            "slow",
            "a",
            vec![tool_step("a", "slow").with_next(["b"]), tool_step("b", "echo")],
        );
        let engine = engine(&connector, vec![flow]);
        let id = engine.submit("slow", Variables::new()).await.unwrap().id;

        wait_for_event(&engine, &id, |k| matches!(k, EventKind::StepStarted { .. })).await;
        assert_eq!(engine.cancel(&id).await.unwrap(), ExecutionStatus::Cancelled);
        // Idempotent once terminal.
        assert_eq!(engine.cancel(&id).await.unwrap(), ExecutionStatus::Cancelled);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let kinds = kinds(&engine, &id).await;
        assert_eq!(started(&kinds), vec!["a"]);
        assert!(matches!(kinds.last(), Some(EventKind::ExecutionCancelled { .. })));
        assert_eq!(connector.call_count("echo"), 0);
    }

    #[tokio::test]
    async fn test_invalid_flow_creates_no_execution() {
        let engine = engine(&echo(), vec![]);
        let flow = Flow::new("bad", "a", vec![tool_step("a", "echo").with_next(["ghost"])]);
        let err = engine.submit_flow(flow, Variables::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::Graph(_)));
        assert!(engine.list(10).await.unwrap().is_empty());

        let err = engine.submit("missing", Variables::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::FlowNotFound(_)));
    }

    #[tokio::test]
    async fn test_feedback_loops_until_condition() {
        let flow = Flow::new(
            "review",
            "draft",
            vec![
                Step::new("draft", StepKind::Agent)
                    .with_param("agent", "writer")
                    .with_param("task", "Write it. Approved: ${approved}")
                    .with_next(["check"]),
                feedback_step("check", "draft", "approved", 3)
                    .with_param("variables", json!({ "approved": true }))
                    .with_next(["publish"]),
                tool_step("publish", "echo"),
            ],
        );
        let agent = MockAgent::new();
        let engine = engine_with_agent(&echo(), agent.clone(), vec![flow]);
        let id = engine.submit("review", Variables::new()).await.unwrap().id;

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(agent.call_count(), 2);
        assert_eq!(agent.requests()[1].task, "Write it. Approved: true");
        assert_eq!(done.steps["check"].iterations, 1);
        assert_eq!(done.steps["draft"].dispatches, 2);

        let kinds = kinds(&engine, &id).await;
        assert_eq!(started(&kinds), vec!["draft", "check", "draft", "check", "publish"]);
        // First pass leaves `${approved}` unresolved.
        assert!(kinds.iter().any(|k| matches!(
            k,
            EventKind::VariablesUpdated { unresolved, .. } if unresolved == &["approved"]
        )));
    }

    #[tokio::test]
    async fn test_feedback_budget_exhausted() {
        let flow = Flow::new(
            "stuck",
            "draft",
            vec![
                tool_step("draft", "echo").with_next(["check"]),
                feedback_step("check", "draft", "never_set", 2),
            ],
        );
        let connector = echo();
        let engine = engine(&connector, vec![flow]);
        let id = engine.submit("stuck", Variables::new()).await.unwrap().id;

        let done = engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("exhausted its retry budget"));
        assert_eq!(connector.call_count("echo"), 3);
        let loops = kinds(&engine, &id)
            .await
            .into_iter()
            .filter(|k| matches!(k, EventKind::FeedbackLooped { .. }))
            .count();
        assert_eq!(loops, 2);
    }

    #[tokio::test]
    async fn test_forward_cycle_rejects_reentry() {
        let flow = Flow::new(
            "cycle",
            "a",
            vec![tool_step("a", "echo").with_next(["b"]), tool_step("b", "echo").with_next(["a"])],
        );
        let engine = engine(&echo(), vec![flow]);
        let id = engine.submit("cycle", Variables::new()).await.unwrap().id;

        assert_eq!(engine.wait(&id).await.unwrap().status, ExecutionStatus::Completed);
        let kinds = kinds(&engine, &id).await;
        assert_eq!(started(&kinds), vec!["a", "b"]);
        assert!(kinds.iter().any(|k| matches!(
            k,
            EventKind::ReentryRejected { from, step_id } if from == "b" && step_id == "a"
        )));
    }

    #[tokio::test]
    async fn test_store_keeps_replayable_record() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&echo(), vec![linear_flow()]).with_store(store.clone());
        let id = engine.submit("linear", Variables::new()).await.unwrap().id;
        let done = engine.wait(&id).await.unwrap();

        let stored = store.load_execution(&id).await.unwrap().unwrap();
        assert_eq!(stored, done);
        let events = store.load_events(&id, 0).await.unwrap();
        assert_eq!(Execution::replay(id.clone(), &events), done);

        let listed = engine.list(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_finished_executions_served_from_store() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&echo(), vec![linear_flow()]).with_store(store.clone());

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = engine.submit("linear", Variables::new()).await.unwrap().id;
            engine.wait(&id).await.unwrap();
            ids.push(id);
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let resident = engine.runs.read().await.len();
                let logs = ids.iter().filter(|id| engine.event_bus().contains(id)).count();
                if resident == 0 && logs == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let id = &ids[0];
        let done = engine.execution(id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(engine.wait(id).await.unwrap(), done);
        assert_eq!(engine.cancel(id).await.unwrap(), ExecutionStatus::Completed);

        let seqs: Vec<u64> = engine.subscribe(id, 2).await.unwrap().map(|e| e.seq).collect().await;
        assert_eq!(seqs, (3..=done.last_seq).collect::<Vec<_>>());
        assert_eq!(engine.events(id, 0).await.unwrap().len() as u64, done.last_seq);
        assert_eq!(engine.list(10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_without_store_executions_stay_resident() {
        let engine = engine(&echo(), vec![linear_flow()]);
        let id = engine.submit("linear", Variables::new()).await.unwrap().id;
        engine.wait(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(engine.event_bus().contains(&id));
        assert_eq!(engine.execution(&id).await.unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running() {
        let connector = echo().with_tool("slow", MockBehavior::Sleep(Duration::from_secs(30)));
        let flow = Flow::new("slow", "a", vec![tool_step("a", "slow")]);
        let engine = engine(&connector, vec![flow]);
        let id = engine.submit("slow", Variables::new()).await.unwrap().id;

        engine.shutdown().await;
        assert_eq!(engine.execution(&id).await.unwrap().status, ExecutionStatus::Cancelled);
    }
}
