use futures::future::BoxFuture;

use crate::config::ToolServerConfig;
use crate::error::{AgentError, Result, SessionError, ToolError};
use crate::event::Event;
use crate::graph::Flow;
use crate::types::*;

/// Durable execution records and event logs.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Insert or replace the execution record.
    fn save_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>>;

    fn load_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>>;

    /// Most recent executions first.
    fn list_executions(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionSummary>>>;

    fn append_event(&self, event: &Event) -> BoxFuture<'_, Result<()>>;

    /// Events with `seq > after_seq`, in order.
    fn load_events(&self, id: &ExecutionId, after_seq: u64) -> BoxFuture<'_, Result<Vec<Event>>>;
}

/// Read access to flow definitions.
pub trait FlowSource: Send + Sync + 'static {
    fn get_flow(&self, id: &str) -> BoxFuture<'_, Result<Option<Flow>>>;

    fn list_flows(&self) -> BoxFuture<'_, Result<Vec<FlowSummary>>>;
}

/// An AI agent backend addressed by binding name.
pub trait AgentProvider: Send + Sync + 'static {
    fn complete(&self, request: AgentRequest) -> BoxFuture<'_, std::result::Result<String, AgentError>>;
}

/// Opens connections to tool servers.
pub trait ToolConnector: Send + Sync + 'static {
    /// Connect and complete the initialization handshake.
    fn connect(
        &self,
        name: &str,
        config: &ToolServerConfig,
    ) -> BoxFuture<'_, std::result::Result<Box<dyn ToolTransport>, SessionError>>;
}

/// A live connection to one tool server.
pub trait ToolTransport: Send + Sync + 'static {
    fn server_info(&self) -> ServerInfo;

    fn list_tools(&self) -> BoxFuture<'_, std::result::Result<Vec<ToolInfo>, ToolError>>;

    fn list_resources(&self) -> BoxFuture<'_, std::result::Result<Vec<ResourceInfo>, ToolError>>;

    fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> BoxFuture<'_, std::result::Result<ToolOutput, ToolError>>;

    /// Whether the underlying connection has gone away.
    fn is_closed(&self) -> bool;

    fn close(&self) -> BoxFuture<'_, ()>;
}
