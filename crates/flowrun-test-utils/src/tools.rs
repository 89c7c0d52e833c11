use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use flowrun_core::config::ToolServerConfig;
use flowrun_core::error::{SessionError, ToolError};
use flowrun_core::traits::{ToolConnector, ToolTransport};
use flowrun_core::types::{ResourceInfo, ServerInfo, ToolInfo, ToolOutput};

/// How a mock tool responds to calls.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return the call arguments as structured output.
    Echo,
    /// Always return this text.
    Text(String),
    /// Fail with a remote error on the first `n` calls, then echo.
    FailTimes(usize),
    /// Always fail with a remote error.
    AlwaysFail(String),
    /// Sleep before echoing.
    Sleep(Duration),
    /// Report the connection as broken, leaving closing to the caller.
    Unhealthy,
}

#[derive(Default)]
struct Shared {
    tools: Mutex<HashMap<String, MockBehavior>>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
    per_tool: Mutex<HashMap<String, usize>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    fail_connect: AtomicBool,
    connect_delay_ms: AtomicUsize,
}

/// A tool connector whose servers expose programmable tools.
#[derive(Clone, Default)]
pub struct MockToolConnector {
    shared: Arc<Shared>,
}

impl MockToolConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(self, name: &str, behavior: MockBehavior) -> Self {
        self.set_tool(name, behavior);
        self
    }

    pub fn set_tool(&self, name: &str, behavior: MockBehavior) {
        self.shared
            .tools
            .lock()
            .unwrap()
            .insert(name.to_string(), behavior);
    }

    /// Make subsequent connects fail (or succeed again).
    pub fn fail_connects(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared
            .connect_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Number of calls made to `tool` across all connections.
    pub fn call_count(&self, tool: &str) -> usize {
        self.shared
            .per_tool
            .lock()
            .unwrap()
            .get(tool)
            .copied()
            .unwrap_or(0)
    }

    /// Every call made, in order.
    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.shared.calls.lock().unwrap().clone()
    }
}

impl ToolConnector for MockToolConnector {
    fn connect(
        &self,
        name: &str,
        _config: &ToolServerConfig,
    ) -> BoxFuture<'_, Result<Box<dyn ToolTransport>, SessionError>> {
        let name = name.to_string();
        Box::pin(async move {
            let delay = self.shared.connect_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }
            self.shared.connects.fetch_add(1, Ordering::SeqCst);
            if self.shared.fail_connect.load(Ordering::SeqCst) {
                return Err(SessionError::ConnectFailed {
                    server: name,
                    message: "connection refused".into(),
                });
            }
            Ok(Box::new(MockTransport {
                server: name,
                shared: self.shared.clone(),
                closed: AtomicBool::new(false),
            }) as Box<dyn ToolTransport>)
        })
    }
}

struct MockTransport {
    server: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl ToolTransport for MockTransport {
    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            name: format!("mock-{}", self.server),
            version: "1.0.0".into(),
        }
    }

    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolInfo>, ToolError>> {
        Box::pin(async move {
            let mut names: Vec<String> = self.shared.tools.lock().unwrap().keys().cloned().collect();
            names.sort();
            Ok(names.into_iter().map(ToolInfo::new).collect())
        })
    }

    fn list_resources(&self) -> BoxFuture<'_, Result<Vec<ResourceInfo>, ToolError>> {
        Box::pin(async move {
            Ok(vec![ResourceInfo {
                uri: format!("mock://{}/readme", self.server),
                name: "readme".into(),
                mime_type: Some("text/plain".into()),
            }])
        })
    }

    fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolOutput, ToolError>> {
        let name = name.to_string();
        Box::pin(async move {
            let behavior = self.shared.tools.lock().unwrap().get(&name).cloned();
            let count = {
                let mut per_tool = self.shared.per_tool.lock().unwrap();
                let count = per_tool.entry(name.clone()).or_insert(0);
                *count += 1;
                *count
            };
            self.shared
                .calls
                .lock()
                .unwrap()
                .push((name.clone(), arguments.clone()));

            let echo = ToolOutput {
                content: arguments.to_string(),
                structured: Some(arguments.clone()),
                is_error: false,
            };
            match behavior {
                None => Err(ToolError::NotFound {
                    server: self.server.clone(),
                    tool: name,
                }),
                Some(MockBehavior::Echo) => Ok(echo),
                Some(MockBehavior::Text(text)) => Ok(ToolOutput::text(text)),
                Some(MockBehavior::FailTimes(n)) if count <= n => Err(ToolError::Remote {
                    server: self.server.clone(),
                    tool: name,
                    message: format!("transient failure {}", count),
                }),
                Some(MockBehavior::FailTimes(_)) => Ok(echo),
                Some(MockBehavior::AlwaysFail(message)) => Err(ToolError::Remote {
                    server: self.server.clone(),
                    tool: name,
                    message,
                }),
                Some(MockBehavior::Sleep(d)) => {
                    tokio::time::sleep(d).await;
                    Ok(echo)
                }
                Some(MockBehavior::Unhealthy) => Err(ToolError::Unhealthy {
                    server: self.server.clone(),
                    message: "transport closed".into(),
                }),
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.shared.closes.fetch_add(1, Ordering::SeqCst);
            }
        })
    }
}
