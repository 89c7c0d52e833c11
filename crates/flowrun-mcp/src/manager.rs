use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowrun_core::config::{SessionConfig, ToolServerConfig};
use flowrun_core::error::{SessionError, ToolError};
use flowrun_core::traits::{ToolConnector, ToolTransport};
use flowrun_core::types::{
    ResourceInfo, ServerInfo, ToolInfo, ToolOutput, ToolServerCapabilities, TransportKind,
};

use crate::handler::McpEvent;

/// A pooled connection to one tool server.
pub struct ToolSession {
    name: String,
    identity: String,
    kind: TransportKind,
    transport: Box<dyn ToolTransport>,
    server: ServerInfo,
    call_timeout: Duration,
    tools: RwLock<Option<Vec<ToolInfo>>>,
    resources: RwLock<Option<Vec<ResourceInfo>>>,
    last_used: std::sync::Mutex<Instant>,
    healthy: AtomicBool,
    in_use: AtomicUsize,
    /// Out of the pool; closed when the last lease is released.
    retired: AtomicBool,
    closing: AtomicBool,
}

impl ToolSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.transport.is_closed()
    }

    /// Number of live leases.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        let mut last = self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        last.elapsed()
    }

    fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    /// Claims the single close of this session's transport.
    fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    /// Take the session out of service. The transport is closed now if
    /// nobody holds a lease, otherwise by the last lease to drop.
    async fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        if self.in_use() == 0 {
            if self.begin_close() {
                self.transport.close().await;
                info!(server = %self.name, "Tool session evicted");
            }
        } else {
            debug!(server = %self.name, in_use = self.in_use(), "Deferring close until leases are released");
        }
    }
}

/// Borrowed use of a pooled session. A session with live leases is never
/// closed, by the idle sweep or by eviction.
pub struct SessionLease {
    session: Arc<ToolSession>,
}

impl SessionLease {
    fn new(session: Arc<ToolSession>) -> Self {
        session.in_use.fetch_add(1, Ordering::SeqCst);
        session.touch();
        Self { session }
    }
}

impl std::ops::Deref for SessionLease {
    type Target = ToolSession;

    fn deref(&self) -> &ToolSession {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.touch();
        let last = self.session.in_use.fetch_sub(1, Ordering::SeqCst) == 1;
        if !last || !self.session.retired.load(Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.session.begin_close() {
            let session = self.session.clone();
            runtime.spawn(async move {
                session.transport.close().await;
                info!(server = %session.name, "Tool session evicted");
            });
        }
    }
}

type ConnectResult = Result<Arc<ToolSession>, SessionError>;

enum Slot {
    Connecting {
        gen: u64,
        fut: Shared<BoxFuture<'static, ConnectResult>>,
    },
    Ready(Arc<ToolSession>),
}

/// Keeps reusable connections to tool servers, keyed by connection identity.
///
/// Connects are single-flight per identity: concurrent acquirers await the
/// same attempt and share its result.
pub struct ToolSessionManager {
    connector: Arc<dyn ToolConnector>,
    config: SessionConfig,
    slots: Mutex<HashMap<String, Slot>>,
    next_gen: AtomicU64,
}

impl ToolSessionManager {
    pub fn new(connector: Arc<dyn ToolConnector>, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            slots: Mutex::new(HashMap::new()),
            next_gen: AtomicU64::new(1),
        }
    }

    /// Lease a healthy session for `config`, connecting if needed.
    pub async fn acquire(
        &self,
        name: &str,
        config: &ToolServerConfig,
    ) -> Result<SessionLease, SessionError> {
        let identity = config.identity();
        let (gen, fut, stale) = {
            let mut slots = self.slots.lock().await;
            let mut stale = None;
            match slots.get(&identity) {
                Some(Slot::Ready(session)) if session.is_healthy() => {
                    return Ok(SessionLease::new(session.clone()));
                }
                Some(Slot::Connecting { gen, fut }) => (*gen, fut.clone(), None),
                existing => {
                    if let Some(Slot::Ready(session)) = existing {
                        warn!(server = %name, identity = %identity, "Evicting unhealthy session");
                        stale = Some(session.clone());
                    }
                    let gen = self.next_gen.fetch_add(1, Ordering::SeqCst);
                    let fut = self.connect_future(name, config).shared();
                    slots.insert(
                        identity.clone(),
                        Slot::Connecting {
                            gen,
                            fut: fut.clone(),
                        },
                    );
                    (gen, fut, stale.take())
                }
            }
        };

        if let Some(session) = stale {
            session.retire().await;
        }

        let result = fut.await;

        let mut slots = self.slots.lock().await;
        let ours = matches!(slots.get(&identity), Some(Slot::Connecting { gen: g, .. }) if *g == gen);
        match result {
            Ok(session) => {
                if ours {
                    slots.insert(identity, Slot::Ready(session.clone()));
                }
                Ok(SessionLease::new(session))
            }
            Err(e) => {
                if ours {
                    slots.remove(&identity);
                }
                Err(e)
            }
        }
    }

    fn connect_future(
        &self,
        name: &str,
        config: &ToolServerConfig,
    ) -> BoxFuture<'static, ConnectResult> {
        let connector = self.connector.clone();
        let name = name.to_string();
        let config = config.clone();
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let call_timeout =
            Duration::from_secs(config.timeout_secs.unwrap_or(self.config.call_timeout_secs));

        async move {
            let transport = match tokio::time::timeout(
                connect_timeout,
                connector.connect(&name, &config),
            )
            .await
            {
                Ok(Ok(t)) => t,
                Ok(Err(e)) => {
                    warn!(server = %name, error = %e, "Tool server connect failed");
                    return Err(e);
                }
                Err(_) => {
                    warn!(server = %name, "Tool server connect timed out");
                    return Err(SessionError::ConnectFailed {
                        server: name,
                        message: format!("connect timed out after {}s", connect_timeout.as_secs()),
                    });
                }
            };

            let server = transport.server_info();
            info!(
                server = %name,
                transport = %config.kind(),
                remote = %server.name,
                version = %server.version,
                "Tool server connected"
            );

            Ok(Arc::new(ToolSession {
                name,
                identity: config.identity(),
                kind: config.kind(),
                transport,
                server,
                call_timeout,
                tools: RwLock::new(None),
                resources: RwLock::new(None),
                last_used: std::sync::Mutex::new(Instant::now()),
                healthy: AtomicBool::new(true),
                in_use: AtomicUsize::new(0),
                retired: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }))
        }
        .boxed()
    }

    /// Discovered tools; served from cache unless `force_refresh`.
    pub async fn list_tools(
        &self,
        session: &SessionLease,
        force_refresh: bool,
    ) -> Result<Vec<ToolInfo>, ToolError> {
        if !force_refresh {
            if let Some(ref tools) = *session.tools.read().await {
                return Ok(tools.clone());
            }
        }
        let tools = match session.transport.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                self.on_tool_error(session, &e).await;
                return Err(e);
            }
        };
        debug!(server = %session.name, count = tools.len(), "Listed tools");
        *session.tools.write().await = Some(tools.clone());
        session.touch();
        Ok(tools)
    }

    pub async fn list_resources(
        &self,
        session: &SessionLease,
        force_refresh: bool,
    ) -> Result<Vec<ResourceInfo>, ToolError> {
        if !force_refresh {
            if let Some(ref resources) = *session.resources.read().await {
                return Ok(resources.clone());
            }
        }
        let resources = match session.transport.list_resources().await {
            Ok(r) => r,
            Err(e) => {
                self.on_tool_error(session, &e).await;
                return Err(e);
            }
        };
        debug!(server = %session.name, count = resources.len(), "Listed resources");
        *session.resources.write().await = Some(resources.clone());
        Ok(resources)
    }

    /// Server info plus the discovered tools and resources.
    pub async fn capabilities(
        &self,
        session: &SessionLease,
    ) -> Result<ToolServerCapabilities, ToolError> {
        let tools = self.list_tools(session, false).await?;
        // Servers without resource support answer with an error; treat as none.
        let resources = self.list_resources(session, false).await.unwrap_or_default();
        Ok(ToolServerCapabilities {
            server: session.server.clone(),
            tools,
            resources,
        })
    }

    /// Invoke a tool on a leased session.
    pub async fn execute(
        &self,
        session: &SessionLease,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        if !session.is_healthy() {
            let e = ToolError::Unhealthy {
                server: session.name.clone(),
                message: "connection closed".into(),
            };
            self.on_tool_error(session, &e).await;
            return Err(e);
        }

        let known = self.list_tools(session, false).await?;
        if !known.iter().any(|t| t.name == tool) {
            let refreshed = self.list_tools(session, true).await?;
            if !refreshed.iter().any(|t| t.name == tool) {
                return Err(ToolError::NotFound {
                    server: session.name.clone(),
                    tool: tool.to_string(),
                });
            }
        }

        debug!(server = %session.name, tool = %tool, "Calling tool");
        let result = tokio::time::timeout(
            session.call_timeout,
            session.transport.call_tool(tool, arguments),
        )
        .await;
        session.touch();

        let output = match result {
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool: tool.to_string(),
                    timeout_secs: session.call_timeout.as_secs(),
                })
            }
            Ok(Err(e)) => {
                self.on_tool_error(session, &e).await;
                return Err(e);
            }
            Ok(Ok(output)) => output,
        };

        if output.is_error {
            return Err(ToolError::Remote {
                server: session.name.clone(),
                tool: tool.to_string(),
                message: output.content,
            });
        }
        Ok(output)
    }

    async fn on_tool_error(&self, session: &SessionLease, error: &ToolError) {
        if matches!(error, ToolError::Unhealthy { .. }) || session.transport.is_closed() {
            warn!(server = %session.name, error = %error, "Marking tool session unhealthy");
            session.mark_unhealthy();
            self.evict(&session.session).await;
        }
    }

    async fn evict(&self, session: &Arc<ToolSession>) {
        let removed = {
            let mut slots = self.slots.lock().await;
            match slots.get(&session.identity) {
                Some(Slot::Ready(s)) if Arc::ptr_eq(s, session) => {
                    slots.remove(&session.identity);
                    true
                }
                _ => false,
            }
        };
        if removed {
            session.retire().await;
        }
    }

    /// Drop the cached tool list of every session for server `name`.
    pub async fn invalidate(&self, name: &str) {
        let sessions: Vec<Arc<ToolSession>> = {
            let slots = self.slots.lock().await;
            slots
                .values()
                .filter_map(|slot| match slot {
                    Slot::Ready(s) if s.name == name => Some(s.clone()),
                    _ => None,
                })
                .collect()
        };
        for session in sessions {
            *session.tools.write().await = None;
            *session.resources.write().await = None;
            debug!(server = %name, "Tool cache invalidated");
        }
    }

    /// Close sessions idle past the configured timeout, and unhealthy ones,
    /// unless leased. Returns how many were closed.
    pub async fn sweep(&self) -> usize {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let expired: Vec<Arc<ToolSession>> = {
            let mut slots = self.slots.lock().await;
            let keys: Vec<String> = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(s)
                        if s.in_use() == 0
                            && (!s.is_healthy() || s.idle_for() >= idle_timeout) =>
                    {
                        Some(key.clone())
                    }
                    _ => None,
                })
                .collect();
            keys.into_iter()
                .filter_map(|k| match slots.remove(&k) {
                    Some(Slot::Ready(s)) => Some(s),
                    _ => None,
                })
                .collect()
        };

        for session in &expired {
            if session.begin_close() {
                session.transport.close().await;
                info!(server = %session.name, "Closed idle tool session");
            }
        }
        expired.len()
    }

    /// Run `sweep` every `sweep_interval_secs` until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let closed = manager.sweep().await;
                        if closed > 0 {
                            debug!(closed, "Session sweep complete");
                        }
                    }
                }
            }
        })
    }

    /// Invalidate tool caches on `tools/list_changed` notifications.
    pub fn spawn_notification_listener(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<McpEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(McpEvent::ToolsChanged { server })
                        | Ok(McpEvent::ResourcesChanged { server }) => {
                            manager.invalidate(&server).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Number of ready sessions in the pool.
    pub async fn session_count(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ToolSession>> = {
            let mut slots = self.slots.lock().await;
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(s) => Some(s),
                    Slot::Connecting { .. } => None,
                })
                .collect()
        };
        for session in sessions {
            if session.begin_close() {
                session.transport.close().await;
                info!(server = %session.name, "Tool session closed");
            }
        }
    }
}
