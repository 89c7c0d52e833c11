use futures::StreamExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use flowrun_core::event::Event;
use flowrun_core::retry::BackoffPolicy;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Invalid stream URL: {0}")]
    InvalidUrl(String),

    #[error("Event stream gave up after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Follows one execution's event stream over WebSocket, reconnecting from
/// the last received sequence number when the connection drops.
pub struct EventStreamClient {
    base_url: String,
    token: Option<String>,
    policy: BackoffPolicy,
}

impl EventStreamClient {
    /// `base_url` is the gateway root, e.g. `http://127.0.0.1:18790`.
    pub fn new(base_url: &str, token: Option<String>, policy: BackoffPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            policy,
        }
    }

    pub fn stream_url(&self, execution_id: &str, from_seq: u64) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!(
            "{base}/api/executions/{}/stream?from_seq={from_seq}",
            urlencoding::encode(execution_id)
        )
    }

    /// Deliver every event after `from_seq` to `on_event` until the
    /// execution's terminal event. Returns the terminal event.
    pub async fn follow<F>(
        &self,
        execution_id: &str,
        from_seq: u64,
        mut on_event: F,
    ) -> Result<Event, StreamError>
    where
        F: FnMut(&Event),
    {
        let mut last_seq = from_seq;
        let mut failures = 0u32;
        let mut replay_once = false;
        let mut confirmed = false;

        loop {
            let replay_from = if std::mem::take(&mut replay_once) { 0 } else { last_seq };
            let last_error = match self
                .connect_once(execution_id, replay_from, last_seq, &mut on_event)
                .await
            {
                Ok(Session::Finished(event)) => return Ok(event),
                Ok(Session::Dropped {
                    last,
                    received,
                    clean,
                }) => {
                    last_seq = last;
                    if received > 0 {
                        failures = 0;
                    }
                    // An offset at or past the end of a finished execution
                    // yields an empty, cleanly closed stream. Replay the log
                    // once to find its terminal event.
                    if clean && received == 0 && !confirmed {
                        confirmed = true;
                        replay_once = true;
                        continue;
                    }
                    "connection closed before the execution finished".to_string()
                }
                Err(ConnectError::Fatal(e)) => return Err(e),
                Err(ConnectError::Retry(msg)) => msg,
            };

            failures += 1;
            if !self.policy.allows(failures) {
                return Err(StreamError::Exhausted {
                    attempts: failures,
                    last_error,
                });
            }
            let delay = self.policy.delay_for(failures);
            warn!(
                execution_id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                from_seq = last_seq,
                error = %last_error,
                "Event stream interrupted, reconnecting"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection replaying from `replay_from`. Events up to `seen`
    /// were already delivered and are not passed to `on_event` again.
    async fn connect_once<F>(
        &self,
        execution_id: &str,
        replay_from: u64,
        seen: u64,
        on_event: &mut F,
    ) -> Result<Session, ConnectError>
    where
        F: FnMut(&Event),
    {
        let url = self.stream_url(execution_id, replay_from);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Fatal(StreamError::InvalidUrl(e.to_string())))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ConnectError::Fatal(StreamError::InvalidUrl(e.to_string())))?;
            request.headers_mut().insert("authorization", value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ConnectError::Retry(e.to_string()))?;
        info!(execution_id, from_seq = replay_from, "Event stream connected");

        let (_, mut ws_rx) = ws_stream.split();
        let mut last = seen;
        let mut received = 0usize;
        let mut clean = true;

        while let Some(msg) = ws_rx.next().await {
            let text = match msg {
                Ok(WsMessage::Text(t)) => t.to_string(),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(execution_id, error = %e, "Event stream read failed");
                    clean = false;
                    break;
                }
            };
            let event: Event = match serde_json::from_str(&text) {
                Ok(e) => e,
                Err(e) => {
                    debug!(execution_id, error = %e, "Invalid event frame");
                    continue;
                }
            };
            // Replays after a reconnect may overlap what was already seen.
            if event.seq <= last {
                if event.kind.is_terminal() {
                    return Ok(Session::Finished(event));
                }
                continue;
            }
            last = event.seq;
            received += 1;
            on_event(&event);
            if event.kind.is_terminal() {
                return Ok(Session::Finished(event));
            }
        }

        Ok(Session::Dropped {
            last,
            received,
            clean,
        })
    }
}

enum Session {
    Finished(Event),
    Dropped {
        last: u64,
        received: usize,
        clean: bool,
    },
}

enum ConnectError {
    Fatal(StreamError),
    Retry(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use flowrun_core::config::GatewayConfig;
    use flowrun_core::types::Variables;
    use flowrun_engine::{FlowCatalog, FlowEngine};
    use flowrun_mcp::ToolSessionManager;
    use flowrun_test_utils::{linear_flow, test_config, MockAgent, MockBehavior, MockToolConnector};

    use crate::GatewayServer;

    #[test]
    fn test_stream_url() {
        let client = EventStreamClient::new("http://127.0.0.1:18790/", None, BackoffPolicy::default());
        assert_eq!(
            client.stream_url("abc", 4),
            "ws://127.0.0.1:18790/api/executions/abc/stream?from_seq=4"
        );
        let client = EventStreamClient::new("https://flows.example.com", None, BackoffPolicy::default());
        assert!(client.stream_url("abc", 0).starts_with("wss://flows.example.com/"));
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let client = EventStreamClient::new(&format!("http://{addr}"), None, BackoffPolicy::immediate(2));

        let err = client.follow("abc", 0, |_| {}).await.unwrap_err();
        assert!(matches!(err, StreamError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_follows_until_terminal_event() {
        let config = test_config();
        let connector = MockToolConnector::new().with_tool("echo", MockBehavior::Echo);
        let sessions = Arc::new(ToolSessionManager::new(
            Arc::new(connector),
            config.sessions.clone(),
        ));
        let engine = Arc::new(FlowEngine::from_config(
            &config,
            Arc::new(FlowCatalog::from_flows([linear_flow()])),
            Arc::new(MockAgent::new()),
            sessions,
        ));
        let id = engine.submit("linear", Variables::new()).await.unwrap().id;
        engine.wait(&id).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = GatewayServer::new(GatewayConfig::default(), engine.clone());
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, server_shutdown).await });

        let client = EventStreamClient::new(&format!("http://{addr}"), None, BackoffPolicy::immediate(3));
        let mut seqs = Vec::new();
        let terminal = client
            .follow(id.as_str(), 2, |e| seqs.push(e.seq))
            .await
            .unwrap();

        assert_eq!(seqs, (3..=8).collect::<Vec<_>>());
        assert_eq!(terminal.kind.name(), "execution_completed");

        // Resuming at or past the end of a finished execution reports its
        // terminal event without delivering anything.
        let client = EventStreamClient::new(&format!("http://{addr}"), None, BackoffPolicy::immediate(0));
        for from_seq in [8, 50] {
            let mut delivered = 0;
            let terminal = client
                .follow(id.as_str(), from_seq, |_| delivered += 1)
                .await
                .unwrap();
            assert_eq!(delivered, 0);
            assert_eq!(terminal.seq, 8);
            assert_eq!(terminal.kind.name(), "execution_completed");
        }
        shutdown.cancel();
    }
}
