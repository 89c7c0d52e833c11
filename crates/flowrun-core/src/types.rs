use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{Event, EventKind};
use crate::graph::Flow;

/// Variable bindings of an execution.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    AwaitingApproval,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::AwaitingApproval => "awaiting_approval",
        };
        f.write_str(s)
    }
}

/// Per-step bookkeeping inside an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    /// Attempts made during the current visit of the step.
    #[serde(default)]
    pub attempts: u32,
    /// Dispatches over the whole execution, loop re-entries included.
    #[serde(default)]
    pub dispatches: u32,
    /// Loop-backs performed by this step (feedback steps only).
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub error: Option<String>,
}

/// One run of a flow against concrete input variables.
///
/// The state is a pure fold of the execution's event log: the scheduler
/// mutates it exclusively through [`Execution::apply`], so replaying the log
/// into an empty execution reproduces it exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub flow_id: String,
    pub variables: Variables,
    pub status: ExecutionStatus,
    pub steps: BTreeMap<String, StepState>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Sequence number of the last applied event.
    pub last_seq: u64,
}

impl Execution {
    /// Create a pending execution with every step of `flow` pending.
    pub fn new(id: ExecutionId, flow: &Flow) -> Self {
        let steps = flow
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepState::default()))
            .collect();
        Self {
            id,
            flow_id: flow.id.clone(),
            variables: Variables::new(),
            status: ExecutionStatus::Pending,
            steps,
            started_at: None,
            ended_at: None,
            error: None,
            last_seq: 0,
        }
    }

    /// Rebuild an execution from its ordered event log.
    pub fn replay<'a>(id: ExecutionId, events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut execution = Self {
            id,
            flow_id: String::new(),
            variables: Variables::new(),
            status: ExecutionStatus::Pending,
            steps: BTreeMap::new(),
            started_at: None,
            ended_at: None,
            error: None,
            last_seq: 0,
        };
        for event in events {
            execution.apply(event);
        }
        execution
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|s| s.status)
    }

    /// Ids of steps currently awaiting an approval decision.
    pub fn awaiting_approval(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::AwaitingApproval)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id.clone(),
            flow_id: self.flow_id.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    fn step_mut(&mut self, step_id: &str) -> &mut StepState {
        self.steps.entry(step_id.to_string()).or_default()
    }

    /// Fold one event into the state.
    pub fn apply(&mut self, event: &Event) {
        self.last_seq = event.seq;
        match &event.kind {
            EventKind::ExecutionStarted {
                flow_id,
                variables,
                steps,
            } => {
                self.flow_id = flow_id.clone();
                self.variables = variables.clone();
                for id in steps {
                    self.steps.entry(id.clone()).or_default();
                }
                self.status = ExecutionStatus::Running;
                self.started_at = Some(event.timestamp);
            }
            EventKind::StepStarted { step_id, attempt } => {
                let step = self.step_mut(step_id);
                step.status = StepStatus::Running;
                step.attempts = *attempt;
                step.dispatches += 1;
            }
            EventKind::StepRetrying {
                step_id, reason, ..
            } => {
                self.step_mut(step_id).error = Some(reason.clone());
            }
            EventKind::StepCompleted {
                step_id, outputs, ..
            } => {
                let step = self.step_mut(step_id);
                step.status = StepStatus::Succeeded;
                step.error = None;
                merge(&mut self.variables, outputs);
            }
            EventKind::StepFailed {
                step_id, reason, ..
            } => {
                let step = self.step_mut(step_id);
                step.status = StepStatus::Failed;
                step.error = Some(reason.clone());
            }
            EventKind::StepSkipped { step_id } => {
                self.step_mut(step_id).status = StepStatus::Skipped;
            }
            EventKind::VariablesUpdated { patch, .. } => {
                merge(&mut self.variables, patch);
            }
            EventKind::ApprovalRequested { step_id, .. } => {
                self.step_mut(step_id).status = StepStatus::AwaitingApproval;
            }
            EventKind::ApprovalResolved { .. } | EventKind::ReentryRejected { .. } => {}
            EventKind::FeedbackLooped {
                step_id,
                iteration,
                patch,
                reset,
                ..
            } => {
                merge(&mut self.variables, patch);
                for id in reset {
                    let step = self.step_mut(id);
                    step.status = StepStatus::Pending;
                    step.attempts = 0;
                    step.error = None;
                }
                self.step_mut(step_id).iterations = *iteration;
            }
            EventKind::ExecutionCompleted { .. } => {
                self.status = ExecutionStatus::Completed;
                self.ended_at = Some(event.timestamp);
            }
            EventKind::ExecutionFailed { reason, .. } => {
                self.status = ExecutionStatus::Failed;
                self.error = Some(reason.clone());
                self.ended_at = Some(event.timestamp);
            }
            EventKind::ExecutionCancelled { reason } => {
                self.status = ExecutionStatus::Cancelled;
                self.error = Some(reason.clone());
                self.ended_at = Some(event.timestamp);
            }
        }
    }
}

fn merge(target: &mut Variables, patch: &Variables) {
    for (k, v) in patch {
        target.insert(k.clone(), v.clone());
    }
}

/// Compact listing entry for an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub flow_id: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Compact listing entry for a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub steps: usize,
}

/// Transport used to reach a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        };
        f.write_str(s)
    }
}

/// Identification reported by a tool server during initialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// A tool discovered on a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

impl ToolInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
        }
    }
}

/// A resource exposed by a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Result of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            structured: None,
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            structured: None,
            is_error: true,
        }
    }

    /// The value written into execution variables: structured content when
    /// present, otherwise parsed JSON text, otherwise the raw text.
    pub fn to_value(&self) -> serde_json::Value {
        if let Some(ref v) = self.structured {
            return v.clone();
        }
        serde_json::from_str(&self.content)
            .unwrap_or_else(|_| serde_json::Value::String(self.content.clone()))
    }
}

/// Capability set discovered on a tool server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolServerCapabilities {
    pub server: ServerInfo,
    pub tools: Vec<ToolInfo>,
    pub resources: Vec<ResourceInfo>,
}

/// A request sent to an agent binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Name of the configured agent binding.
    pub binding: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub task: String,
}
