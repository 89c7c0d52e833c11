use std::path::Path;

use serde_json::{json, Value};
use tempfile::TempDir;

use flowrun_core::config::{AppConfig, ToolServerConfig};
use flowrun_core::graph::{Flow, Step, StepKind};
use flowrun_core::types::Variables;

/// Name of the tool server every fixture step talks to.
pub const MOCK_SERVER: &str = "mock";

/// Config with a single `mock` tool server and fast retries.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config
        .tool_servers
        .insert(MOCK_SERVER.to_string(), ToolServerConfig::stdio("mock-server", vec![]));
    config.engine.retry_base_delay_ms = 1;
    config.engine.retry_max_delay_ms = 5;
    config.engine.default_step_timeout_secs = 5;
    config
}

pub fn tool_step(id: &str, tool: &str) -> Step {
    Step::new(id, StepKind::Tool)
        .with_param("server", MOCK_SERVER)
        .with_param("tool", tool)
        .with_param("arguments", json!({ "step": id }))
}

pub fn agent_step(id: &str, binding: &str, task: &str) -> Step {
    Step::new(id, StepKind::Agent)
        .with_param("agent", binding)
        .with_param("task", task)
}

pub fn condition_step(id: &str, expression: &str, branches: Value) -> Step {
    Step::new(id, StepKind::Condition)
        .with_param("expression", expression)
        .with_param("branches", branches)
}

pub fn parallel_step(id: &str) -> Step {
    Step::new(id, StepKind::Parallel)
}

pub fn approval_step(id: &str, message: &str) -> Step {
    Step::new(id, StepKind::Approval).with_param("message", message)
}

pub fn feedback_step(id: &str, target: &str, until: &str, max_loops: u32) -> Step {
    Step::new(id, StepKind::Feedback)
        .with_param("target", target)
        .with_param("until", until)
        .with_retries(max_loops)
}

/// `a -> b -> c` over the echo tool.
pub fn linear_flow() -> Flow {
    Flow::new(
        "linear",
        "a",
        vec![
            tool_step("a", "echo").with_next(["b"]),
            tool_step("b", "echo").with_next(["c"]),
            tool_step("c", "echo"),
        ],
    )
}

/// `fan -> {left, right} -> join`.
pub fn fan_out_flow() -> Flow {
    Flow::new(
        "fan",
        "fan",
        vec![
            parallel_step("fan").with_next(["left", "right"]),
            tool_step("left", "echo").with_next(["join"]),
            tool_step("right", "slow").with_next(["join"]),
            tool_step("join", "echo"),
        ],
    )
}

pub fn vars(pairs: &[(&str, Value)]) -> Variables {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Write flows into a fresh directory, alternating JSON and TOML files.
pub fn write_flow_dir(flows: &[Flow]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (i, flow) in flows.iter().enumerate() {
        write_flow(dir.path(), flow, i % 2 == 1);
    }
    dir
}

pub fn write_flow(dir: &Path, flow: &Flow, as_toml: bool) {
    if as_toml {
        let content = toml::to_string(flow).unwrap();
        std::fs::write(dir.join(format!("{}.toml", flow.id)), content).unwrap();
    } else {
        let content = serde_json::to_string_pretty(flow).unwrap();
        std::fs::write(dir.join(format!("{}.json", flow.id)), content).unwrap();
    }
}
