use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::{debug, info};

use rmcp::model::{CallToolRequestParams, RawContent};
use rmcp::service::{Peer, RunningService};
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::{RoleClient, ServiceExt};

use flowrun_core::config::{ToolServerConfig, ToolTransportConfig};
use flowrun_core::error::{SessionError, ToolError};
use flowrun_core::traits::{ToolConnector, ToolTransport};
use flowrun_core::types::{ResourceInfo, ServerInfo, ToolInfo, ToolOutput};

use crate::handler::{FlowrunClientHandler, McpEvent};

type McpConnection = RunningService<RoleClient, FlowrunClientHandler>;

/// Opens MCP connections over child-process stdio or streamable HTTP.
pub struct McpConnector {
    event_tx: broadcast::Sender<McpEvent>,
}

impl Default for McpConnector {
    fn default() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self { event_tx }
    }
}

impl McpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to server notifications (tools_changed, resources_changed, logs).
    pub fn subscribe_events(&self) -> broadcast::Receiver<McpEvent> {
        self.event_tx.subscribe()
    }

    async fn open(
        &self,
        name: &str,
        config: &ToolServerConfig,
    ) -> Result<McpConnection, SessionError> {
        let handler = FlowrunClientHandler::new(name, self.event_tx.clone());
        let failed = |message: String| SessionError::ConnectFailed {
            server: name.to_string(),
            message,
        };

        match &config.transport {
            ToolTransportConfig::Stdio { command, args, env } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                for (k, v) in env {
                    cmd.env(k, v);
                }

                let transport = rmcp::transport::TokioChildProcess::new(cmd)
                    .map_err(|e| failed(format!("Failed to spawn {}: {}", command, e)))?;

                handler
                    .serve(transport)
                    .await
                    .map_err(|e| failed(format!("Initialization failed: {}", e)))
            }
            ToolTransportConfig::Http { url } | ToolTransportConfig::Sse { url } => {
                let transport = if config.headers.is_empty() {
                    StreamableHttpClientTransport::from_uri(url.as_str())
                } else {
                    let client = http_client(&config.headers).map_err(failed)?;
                    StreamableHttpClientTransport::with_client(
                        client,
                        StreamableHttpClientTransportConfig::with_uri(url.as_str()),
                    )
                };

                <FlowrunClientHandler as ServiceExt<RoleClient>>::serve(handler, transport)
                    .await
                    .map_err(|e| failed(format!("Initialization failed: {}", e)))
            }
        }
    }
}

/// HTTP client sending the configured headers on every request.
fn http_client(headers: &HashMap<String, String>) -> Result<reqwest::Client, String> {
    let mut map = http::HeaderMap::new();
    for (k, v) in headers {
        let name = http::HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| format!("Invalid header name '{}': {}", k, e))?;
        let value = http::HeaderValue::from_str(v)
            .map_err(|e| format!("Invalid value for header '{}': {}", k, e))?;
        map.insert(name, value);
    }
    reqwest::Client::builder()
        .default_headers(map)
        .build()
        .map_err(|e| e.to_string())
}

impl ToolConnector for McpConnector {
    fn connect(
        &self,
        name: &str,
        config: &ToolServerConfig,
    ) -> BoxFuture<'_, Result<Box<dyn ToolTransport>, SessionError>> {
        let name = name.to_string();
        let config = config.clone();
        Box::pin(async move {
            let client = self.open(&name, &config).await?;
            let info = client
                .peer_info()
                .map(|i| ServerInfo {
                    name: i.server_info.name.clone(),
                    version: i.server_info.version.clone(),
                })
                .unwrap_or_default();
            info!(server = %name, transport = %config.kind(), "MCP server connected");

            Ok(Box::new(McpTransport {
                name,
                info,
                peer: client.peer().clone(),
                service: std::sync::Mutex::new(Some(client)),
            }) as Box<dyn ToolTransport>)
        })
    }
}

/// A live MCP client connection.
pub struct McpTransport {
    name: String,
    info: ServerInfo,
    peer: Peer<RoleClient>,
    service: std::sync::Mutex<Option<McpConnection>>,
}

impl McpTransport {
    fn call_error(&self, tool: &str, e: rmcp::ServiceError) -> ToolError {
        classify_service_error(&self.name, tool, e)
    }
}

/// Only a broken transport makes the session unhealthy; errors the server
/// answered with leave the connection usable.
fn classify_service_error(server: &str, tool: &str, e: rmcp::ServiceError) -> ToolError {
    use rmcp::ServiceError;

    match e {
        ServiceError::TransportClosed | ServiceError::TransportSend(_) => ToolError::Unhealthy {
            server: server.to_string(),
            message: e.to_string(),
        },
        ServiceError::Timeout { timeout } => ToolError::Timeout {
            tool: tool.to_string(),
            timeout_secs: timeout.as_secs(),
        },
        other => ToolError::Remote {
            server: server.to_string(),
            tool: tool.to_string(),
            message: other.to_string(),
        },
    }
}

impl ToolTransport for McpTransport {
    fn server_info(&self) -> ServerInfo {
        self.info.clone()
    }

    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolInfo>, ToolError>> {
        Box::pin(async move {
            let tools = self
                .peer
                .list_all_tools()
                .await
                .map_err(|e| self.call_error("tools/list", e))?;

            debug!(server = %self.name, count = tools.len(), "Listed MCP tools");
            Ok(tools
                .into_iter()
                .map(|t| ToolInfo {
                    name: t.name.to_string(),
                    description: t.description.map(|d| d.to_string()),
                    input_schema: serde_json::Value::Object((*t.input_schema).clone()),
                })
                .collect())
        })
    }

    fn list_resources(&self) -> BoxFuture<'_, Result<Vec<ResourceInfo>, ToolError>> {
        Box::pin(async move {
            let resources = self
                .peer
                .list_all_resources()
                .await
                .map_err(|e| self.call_error("resources/list", e))?;

            debug!(server = %self.name, count = resources.len(), "Listed MCP resources");
            Ok(resources
                .into_iter()
                .map(|r| ResourceInfo {
                    uri: r.uri.clone(),
                    name: r.name.clone(),
                    mime_type: r.mime_type.clone(),
                })
                .collect())
        })
    }

    fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolOutput, ToolError>> {
        let tool = name.to_string();
        Box::pin(async move {
            let params = CallToolRequestParams {
                name: tool.clone().into(),
                arguments: arguments.as_object().cloned(),
                meta: None,
                task: None,
            };

            let result = self
                .peer
                .call_tool(params)
                .await
                .map_err(|e| self.call_error(&tool, e))?;

            // Convert result content to string
            let content: Vec<String> = result
                .content
                .iter()
                .map(|c| match c.raw {
                    RawContent::Text(ref t) => t.text.to_string(),
                    _ => format!("{:?}", c.raw),
                })
                .collect();

            Ok(ToolOutput {
                content: content.join("\n"),
                structured: result.structured_content,
                is_error: result.is_error.unwrap_or(false),
            })
        })
    }

    fn is_closed(&self) -> bool {
        let service = self.service.lock().unwrap_or_else(|e| e.into_inner());
        service.as_ref().map(|s| s.is_closed()).unwrap_or(true)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let service = {
                let mut guard = self.service.lock().unwrap_or_else(|e| e.into_inner());
                guard.take()
            };
            if let Some(mut service) = service {
                let _ = service.close().await;
                info!(server = %self.name, "MCP server disconnected");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_client_rejects_bad_header() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(http_client(&headers).is_err());

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        assert!(http_client(&headers).is_ok());
    }

    #[test]
    fn test_only_transport_failures_are_unhealthy() {
        let closed = classify_service_error("files", "read", rmcp::ServiceError::TransportClosed);
        assert!(matches!(closed, ToolError::Unhealthy { ref server, .. } if server == "files"));

        let remote = classify_service_error(
            "files",
            "read",
            rmcp::ServiceError::McpError(rmcp::ErrorData::internal_error("upstream closed", None)),
        );
        assert!(matches!(remote, ToolError::Remote { ref tool, .. } if tool == "read"));

        let cancelled = classify_service_error(
            "files",
            "read",
            rmcp::ServiceError::Cancelled {
                reason: Some("Transport restarting".into()),
            },
        );
        assert!(matches!(cancelled, ToolError::Remote { .. }));

        let timeout = classify_service_error(
            "files",
            "read",
            rmcp::ServiceError::Timeout {
                timeout: std::time::Duration::from_secs(7),
            },
        );
        assert!(matches!(timeout, ToolError::Timeout { timeout_secs: 7, .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_connect_error() {
        let connector = McpConnector::new();
        let config = ToolServerConfig::stdio("/nonexistent/flowrun-tool-server", vec![]);
        let err = connector.connect("missing", &config).await.err().unwrap();
        assert!(matches!(err, SessionError::ConnectFailed { ref server, .. } if server == "missing"));
    }
}
