use std::future::Future;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use rmcp::handler::client::ClientHandler;
use rmcp::model::*;
use rmcp::service::{NotificationContext, RequestContext};
use rmcp::ErrorData as McpError;
use rmcp::RoleClient;

/// Server notifications forwarded to the session manager.
#[derive(Debug, Clone)]
pub enum McpEvent {
    ToolsChanged { server: String },
    ResourcesChanged { server: String },
    LogMessage {
        server: String,
        level: String,
        message: String,
    },
}

/// Client-side handler for one tool server connection.
pub struct FlowrunClientHandler {
    server_name: String,
    event_tx: broadcast::Sender<McpEvent>,
}

impl FlowrunClientHandler {
    pub fn new(server_name: &str, event_tx: broadcast::Sender<McpEvent>) -> Self {
        Self {
            server_name: server_name.to_string(),
            event_tx,
        }
    }
}

#[allow(clippy::manual_async_fn)]
impl ClientHandler for FlowrunClientHandler {
    fn on_tool_list_changed(
        &self,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async {
            debug!(server = %self.server_name, "tools/list_changed notification");
            let _ = self.event_tx.send(McpEvent::ToolsChanged {
                server: self.server_name.clone(),
            });
        }
    }

    fn on_resource_list_changed(
        &self,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async {
            debug!(server = %self.server_name, "resources/list_changed notification");
            let _ = self.event_tx.send(McpEvent::ResourcesChanged {
                server: self.server_name.clone(),
            });
        }
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            let level = format!("{:?}", params.level);
            let message = params.data.to_string();
            debug!(server = %self.server_name, level = %level, "Tool server log: {}", message);
            let _ = self.event_tx.send(McpEvent::LogMessage {
                server: self.server_name.clone(),
                level,
                message,
            });
        }
    }

    fn create_message(
        &self,
        _params: CreateMessageRequestParams,
        _ctx: RequestContext<RoleClient>,
    ) -> impl Future<Output = Result<CreateMessageResult, McpError>> + Send + '_ {
        async {
            warn!(server = %self.server_name, "Server requested sampling, which flow steps do not support");
            Err(McpError::method_not_found::<CreateMessageRequestMethod>())
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            meta: None,
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "flowrun".into(),
                title: None,
                version: env!("CARGO_PKG_VERSION").into(),
                description: None,
                icons: None,
                website_url: None,
            },
        }
    }
}
