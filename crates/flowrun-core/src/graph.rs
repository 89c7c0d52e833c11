//! Flow graph model: immutable flow descriptions, structural validation and
//! the derived index the scheduler walks.
//!
//! A flow is a list of steps joined by `next_steps` edges. Cycles are only
//! legitimate through feedback steps, whose loop-back target is a parameter
//! rather than an edge; any other cycle is caught at runtime as re-entry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, GraphError, Result};
use crate::types::{FlowSummary, Variables};

/// The closed set of step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Agent,
    Tool,
    Condition,
    Parallel,
    Approval,
    Feedback,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Condition => "condition",
            Self::Parallel => "parallel",
            Self::Approval => "approval",
            Self::Feedback => "feedback",
        };
        f.write_str(s)
    }
}

/// Editor canvas position. Ignored by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single node of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "type")]
    pub kind: StepKind,
    /// Kind-specific parameters; string leaves may contain `${var}` placeholders.
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    #[serde(default, alias = "next")]
    pub next_steps: Vec<String>,
    /// Re-dispatches allowed after a retryable failure. For feedback steps,
    /// the number of loop-backs allowed.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// A best-effort step's failure does not fail the execution.
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub position: Position,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            params: serde_json::Map::new(),
            next_steps: vec![],
            retry_count: 0,
            timeout_secs: None,
            best_effort: false,
            position: Position::default(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_next<I, S>(mut self, next: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_steps = next.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// An immutable, named automation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(alias = "start_step")]
    pub start: String,
    pub steps: Vec<Step>,
    /// Declared variables and their defaults.
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

fn default_version() -> u32 { 1 }

impl Flow {
    pub fn new(id: impl Into<String>, start: impl Into<String>, steps: Vec<Step>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: 1,
            start: start.into(),
            steps,
            variables: Variables::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, default: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), default.into());
        self
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version,
            steps: self.steps.len(),
        }
    }

    /// Flow defaults overlaid with caller overrides. Also returns override
    /// keys that the flow does not declare.
    pub fn bind_variables(&self, overrides: &Variables) -> (Variables, Vec<String>) {
        let mut vars = self.variables.clone();
        let mut undeclared = Vec::new();
        for (k, v) in overrides {
            if !self.variables.contains_key(k) {
                undeclared.push(k.clone());
            }
            vars.insert(k.clone(), v.clone());
        }
        (vars, undeclared)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Load a flow from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FlowError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            Some("toml") => Self::from_toml(&content),
            _ => Err(FlowError::Config(format!(
                "Unsupported flow file extension: {}",
                path.display()
            ))),
        }
    }
}

/// Check a flow's structure. Nothing is executed for a flow that fails here.
pub fn validate(flow: &Flow) -> std::result::Result<(), GraphError> {
    let mut ids = HashSet::new();
    for step in &flow.steps {
        if !ids.insert(step.id.as_str()) {
            return Err(GraphError::DuplicateStep(step.id.clone()));
        }
    }

    if !ids.contains(flow.start.as_str()) {
        return Err(GraphError::MissingStart(flow.start.clone()));
    }

    for step in &flow.steps {
        for next in &step.next_steps {
            if !ids.contains(next.as_str()) {
                return Err(GraphError::DanglingEdge {
                    from: step.id.clone(),
                    to: next.clone(),
                });
            }
        }
    }

    let index = GraphIndex::build(flow);
    for step in &flow.steps {
        if !index.is_reachable(&step.id) {
            return Err(GraphError::UnreachableStep(step.id.clone()));
        }
    }

    for step in &flow.steps {
        validate_params(step, &index)?;
    }
    Ok(())
}

fn require(step: &Step, param: &str) -> std::result::Result<(), GraphError> {
    match step.param(param) {
        Some(v) if !v.is_null() => Ok(()),
        _ => Err(GraphError::MissingParam {
            step: step.id.clone(),
            param: param.to_string(),
        }),
    }
}

fn validate_params(step: &Step, index: &GraphIndex) -> std::result::Result<(), GraphError> {
    match step.kind {
        StepKind::Agent => require(step, "task"),
        StepKind::Tool => require(step, "tool"),
        StepKind::Parallel | StepKind::Approval => Ok(()),
        StepKind::Condition => {
            require(step, "expression")?;
            let mut targets: Vec<&str> = Vec::new();
            if let Some(Value::Object(branches)) = step.param("branches") {
                for value in branches.values() {
                    match value {
                        Value::String(s) => targets.push(s),
                        Value::Array(items) => targets.extend(items.iter().filter_map(Value::as_str)),
                        _ => {}
                    }
                }
            }
            match step.param("default") {
                Some(Value::String(s)) => targets.push(s),
                Some(Value::Array(items)) => targets.extend(items.iter().filter_map(Value::as_str)),
                _ => {}
            }
            for target in targets {
                if !step.next_steps.iter().any(|n| n == target) {
                    return Err(GraphError::InvalidBranch {
                        step: step.id.clone(),
                        target: target.to_string(),
                    });
                }
            }
            Ok(())
        }
        StepKind::Feedback => {
            require(step, "target")?;
            let target = step.param_str("target").unwrap_or_default();
            if target == step.id || !index.is_ancestor(target, &step.id) {
                return Err(GraphError::InvalidFeedbackTarget {
                    step: step.id.clone(),
                    target: target.to_string(),
                });
            }
            Ok(())
        }
    }
}

/// Derived adjacency for a flow.
///
/// Back edges are the edges that close a cycle during a depth-first walk
/// from the start step. They are excluded from forward predecessor sets so a
/// join never waits on a step that can only run after it.
#[derive(Debug, Clone)]
pub struct GraphIndex {
    order: Vec<String>,
    successors: HashMap<String, Vec<String>>,
    predecessors: HashMap<String, BTreeSet<String>>,
    back_edges: HashSet<(String, String)>,
    reachable: HashSet<String>,
}

impl GraphIndex {
    /// Build the index. Edges to unknown steps are ignored.
    pub fn build(flow: &Flow) -> Self {
        let known: HashSet<&str> = flow.steps.iter().map(|s| s.id.as_str()).collect();
        let successors: HashMap<String, Vec<String>> = flow
            .steps
            .iter()
            .map(|s| {
                let next = s
                    .next_steps
                    .iter()
                    .filter(|n| known.contains(n.as_str()))
                    .cloned()
                    .collect();
                (s.id.clone(), next)
            })
            .collect();

        let mut back_edges = HashSet::new();
        let mut reachable = HashSet::new();
        if known.contains(flow.start.as_str()) {
            // Iterative DFS: (node, index of next successor to visit).
            let mut on_stack: HashSet<String> = HashSet::new();
            let mut stack: Vec<(String, usize)> = vec![(flow.start.clone(), 0)];
            on_stack.insert(flow.start.clone());
            reachable.insert(flow.start.clone());

            while let Some((node, idx)) = stack.last().cloned() {
                let next = successors.get(&node).and_then(|s| s.get(idx)).cloned();
                match next {
                    Some(next) => {
                        if let Some(top) = stack.last_mut() {
                            top.1 += 1;
                        }
                        if on_stack.contains(&next) {
                            back_edges.insert((node.clone(), next));
                        } else if reachable.insert(next.clone()) {
                            on_stack.insert(next.clone());
                            stack.push((next, 0));
                        }
                    }
                    None => {
                        on_stack.remove(&node);
                        stack.pop();
                    }
                }
            }
        }

        let mut predecessors: HashMap<String, BTreeSet<String>> = flow
            .steps
            .iter()
            .map(|s| (s.id.clone(), BTreeSet::new()))
            .collect();
        for (from, nexts) in &successors {
            for to in nexts {
                if back_edges.contains(&(from.clone(), to.clone())) {
                    continue;
                }
                if let Some(set) = predecessors.get_mut(to) {
                    set.insert(from.clone());
                }
            }
        }

        Self {
            order: flow.steps.iter().map(|s| s.id.clone()).collect(),
            successors,
            predecessors,
            back_edges,
            reachable,
        }
    }

    /// Step ids in declaration order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Forward predecessors (back edges excluded).
    pub fn predecessors(&self, id: &str) -> impl Iterator<Item = &String> {
        self.predecessors.get(id).into_iter().flatten()
    }

    pub fn is_back_edge(&self, from: &str, to: &str) -> bool {
        self.back_edges.contains(&(from.to_string(), to.to_string()))
    }

    pub fn is_reachable(&self, id: &str) -> bool {
        self.reachable.contains(id)
    }

    fn forward_successors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.successors(id)
            .iter()
            .filter(move |to| !self.is_back_edge(id, to))
    }

    fn descendants(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(node) = stack.pop() {
            if seen.insert(node.clone()) {
                for next in self.forward_successors(&node) {
                    stack.push(next.clone());
                }
            }
        }
        seen
    }

    /// Whether `ancestor` reaches `id` along forward edges.
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        ancestor != id && self.descendants(ancestor).contains(id)
    }

    /// Steps on some forward path from `target` to `feedback`, both included,
    /// in declaration order.
    pub fn loop_body(&self, target: &str, feedback: &str) -> Vec<String> {
        let down = self.descendants(target);
        self.order
            .iter()
            .filter(|id| down.contains(*id) && (id.as_str() == feedback || self.is_ancestor(id, feedback)))
            .cloned()
            .collect()
    }
}
