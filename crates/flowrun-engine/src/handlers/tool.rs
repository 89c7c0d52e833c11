use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use flowrun_core::config::ToolServerConfig;
use flowrun_core::error::FlowError;
use flowrun_core::types::Variables;
use flowrun_mcp::ToolSessionManager;

use super::{StepContext, StepHandler, StepOutcome};

/// Calls a tool on a pooled tool server session.
pub struct ToolHandler {
    sessions: Arc<ToolSessionManager>,
    servers: BTreeMap<String, ToolServerConfig>,
}

impl ToolHandler {
    pub fn new(sessions: Arc<ToolSessionManager>, servers: BTreeMap<String, ToolServerConfig>) -> Self {
        Self { sessions, servers }
    }

    /// Resolve the server either by configured name or from an inline
    /// `connection` object.
    fn server_config(&self, ctx: &StepContext) -> Result<(String, ToolServerConfig), String> {
        if let Some(connection) = ctx.param("connection") {
            let config: ToolServerConfig = serde_json::from_value(connection.clone())
                .map_err(|e| format!("Invalid inline connection on step '{}': {}", ctx.step.id, e))?;
            let name = ctx
                .param_str("server")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}-inline", ctx.step.id));
            return Ok((name, config));
        }

        let name = ctx
            .param_str("server")
            .ok_or_else(|| format!("Tool step '{}' names no server", ctx.step.id))?;
        let config = self
            .servers
            .get(name)
            .cloned()
            .ok_or_else(|| format!("Unknown tool server: {}", name))?;
        Ok((name.to_string(), config))
    }
}

impl StepHandler for ToolHandler {
    fn run(&self, ctx: StepContext) -> BoxFuture<'_, StepOutcome> {
        Box::pin(async move {
            let (server, config) = match self.server_config(&ctx) {
                Ok(found) => found,
                Err(reason) => return StepOutcome::fatal(reason),
            };
            let Some(tool) = ctx.param_str("tool").map(str::to_string) else {
                return StepOutcome::fatal(format!("Tool step '{}' names no tool", ctx.step.id));
            };
            let arguments = ctx
                .param("arguments")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));

            let lease = match self.sessions.acquire(&server, &config).await {
                Ok(lease) => lease,
                Err(e) => {
                    let e = FlowError::from(e);
                    return StepOutcome::Failed {
                        retryable: e.is_retryable(),
                        reason: e.to_string(),
                    };
                }
            };

            debug!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step.id,
                server = %server,
                tool = %tool,
                "Running tool step"
            );

            match self.sessions.execute(&lease, &tool, arguments).await {
                Ok(output) => {
                    let mut patch = Variables::new();
                    patch.insert(ctx.output_key(), output.to_value());
                    StepOutcome::succeeded(patch)
                }
                Err(e) => StepOutcome::Failed {
                    retryable: e.is_retryable(),
                    reason: e.to_string(),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::ctx;
    use flowrun_core::config::SessionConfig;
    use flowrun_test_utils::{test_config, tool_step, vars, MockBehavior, MockToolConnector};
    use serde_json::json;

    fn handler(connector: &MockToolConnector) -> ToolHandler {
        let sessions = Arc::new(ToolSessionManager::new(
            Arc::new(connector.clone()),
            SessionConfig::default(),
        ));
        ToolHandler::new(sessions, test_config().tool_servers)
    }

    #[tokio::test]
    async fn test_arguments_rendered_and_output_stored() {
        let connector = MockToolConnector::new().with_tool("echo", MockBehavior::Echo);
        let step = tool_step("fetch", "echo")
            .with_param("arguments", json!({ "city": "${city}", "days": "${days}" }))
            .with_param("output", "forecast");

        let outcome = handler(&connector)
            .run(ctx(step, vars(&[("city", json!("Oslo")), ("days", json!(3))])))
            .await;
        match outcome {
            StepOutcome::Succeeded { patch, .. } => {
                assert_eq!(patch["forecast"], json!({ "city": "Oslo", "days": 3 }));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(connector.calls()[0].0, "echo");
    }

    #[tokio::test]
    async fn test_remote_error_retryable_missing_tool_not() {
        let connector = MockToolConnector::new().with_tool("flaky", MockBehavior::FailTimes(1));
        let h = handler(&connector);

        let outcome = h.run(ctx(tool_step("a", "flaky"), Variables::new())).await;
        assert!(matches!(outcome, StepOutcome::Failed { retryable: true, .. }));

        let outcome = h.run(ctx(tool_step("b", "missing"), Variables::new())).await;
        assert!(matches!(outcome, StepOutcome::Failed { retryable: false, .. }));
    }

    #[tokio::test]
    async fn test_unknown_server_is_fatal() {
        let connector = MockToolConnector::new().with_tool("echo", MockBehavior::Echo);
        let step = tool_step("a", "echo").with_param("server", "nowhere");
        match handler(&connector).run(ctx(step, Variables::new())).await {
            StepOutcome::Failed { reason, retryable } => {
                assert!(!retryable);
                assert!(reason.contains("nowhere"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_inline_connection() {
        let connector = MockToolConnector::new().with_tool("echo", MockBehavior::Echo);
        let mut step = tool_step("a", "echo");
        step.params.remove("server");
        step.params.insert(
            "connection".into(),
            json!({ "transport": { "type": "http", "url": "http://localhost:9/mcp" } }),
        );
        let outcome = handler(&connector).run(ctx(step, Variables::new())).await;
        assert!(matches!(outcome, StepOutcome::Succeeded { .. }));
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_retryable() {
        let connector = MockToolConnector::new().with_tool("echo", MockBehavior::Echo);
        connector.fail_connects(true);
        let outcome = handler(&connector)
            .run(ctx(tool_step("a", "echo"), Variables::new()))
            .await;
        assert!(matches!(outcome, StepOutcome::Failed { retryable: true, .. }));
    }
}
