use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::retry::BackoffPolicy;
use crate::types::TransportKind;

/// Top-level flowrun configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub tool_servers: BTreeMap<String, ToolServerConfig>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    /// Reconnect policy for event stream clients.
    #[serde(default)]
    pub client: BackoffPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout for steps that do not set their own.
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: u64,
    #[serde(default = "default_retry_base")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    /// Live fan-out buffer per execution; slower subscribers catch up from the log.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Directory scanned for `.json` / `.toml` flow definitions.
    #[serde(default = "default_flows_dir")]
    pub flows_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout(),
            retry_base_delay_ms: default_retry_base(),
            retry_max_delay_ms: default_retry_max(),
            retry_multiplier: default_retry_multiplier(),
            event_buffer: default_event_buffer(),
            flows_dir: default_flows_dir(),
        }
    }
}

fn default_step_timeout() -> u64 { 300 }
fn default_retry_base() -> u64 { 500 }
fn default_retry_max() -> u64 { 30_000 }
fn default_retry_multiplier() -> f64 { 2.0 }
fn default_event_buffer() -> usize { 256 }
fn default_flows_dir() -> String { "~/.flowrun/flows".to_string() }

impl EngineConfig {
    /// Backoff for a step with the given retry budget.
    pub fn step_backoff(&self, retry_count: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: retry_count,
            base_delay_ms: self.retry_base_delay_ms,
            multiplier: self.retry_multiplier,
            max_delay_ms: self.retry_max_delay_ms,
            jitter: true,
        }
    }

    pub fn flows_dir(&self) -> PathBuf {
        expand_home(&self.flows_dir)
    }
}

/// Tool session pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions unused for this long are closed by the sweeper.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per-call timeout for servers that do not set `timeout_secs`.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            connect_timeout_secs: default_connect_timeout(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

fn default_idle_timeout() -> u64 { 300 }
fn default_sweep_interval() -> u64 { 30 }
fn default_connect_timeout() -> u64 { 30 }
fn default_call_timeout() -> u64 { 120 }

/// Configuration for a single tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub transport: ToolTransportConfig,
    /// Custom HTTP headers for http/sse transports (e.g., auth tokens).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-call timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolTransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
    Sse {
        url: String,
    },
}

impl ToolServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: ToolTransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            headers: HashMap::new(),
            timeout_secs: None,
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            transport: ToolTransportConfig::Http { url: url.into() },
            headers: HashMap::new(),
            timeout_secs: None,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            ToolTransportConfig::Stdio { .. } => TransportKind::Stdio,
            ToolTransportConfig::Http { .. } => TransportKind::Http,
            ToolTransportConfig::Sse { .. } => TransportKind::Sse,
        }
    }

    /// Connection identity; equal identities share one pooled session.
    pub fn identity(&self) -> String {
        match &self.transport {
            ToolTransportConfig::Stdio { command, args, .. } => {
                let mut id = format!("stdio:{}", command);
                for arg in args {
                    id.push(' ');
                    id.push_str(arg);
                }
                id
            }
            ToolTransportConfig::Http { url } => format!("http:{}", url),
            ToolTransportConfig::Sse { url } => format!("sse:{}", url),
        }
    }
}

/// An agent binding: which provider and model a step's `agent` name maps to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Keep executions in memory only.
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            in_memory: false,
        }
    }
}

fn default_store_path() -> String { "~/.flowrun/flowrun.db".to_string() }

impl StoreConfig {
    pub fn path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            api_keys: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub role: ApiKeyRole,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    /// Read flows, executions and events
    Viewer,
    /// Read + submit, cancel and approve
    #[default]
    Operator,
    /// Full access
    Admin,
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Default config location (`~/.flowrun/config.toml`).
    pub fn default_path() -> PathBuf {
        expand_home("~/.flowrun/config.toml")
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLOWRUN_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLOWRUN_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLOWRUN_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FLOWRUN_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FLOWRUN_VAR}\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.default_step_timeout_secs, 300);
        assert_eq!(config.sessions.idle_timeout_secs, 300);
        assert!(config.tool_servers.is_empty());
        assert!(config.gateway.is_none());
        assert_eq!(config.client.max_attempts, 5);
    }

    #[test]
    fn test_tool_servers_and_identity() {
        let toml_str = r#"
[tool_servers.files]
transport = { type = "stdio", command = "npx", args = ["-y", "fs-server"] }
timeout_secs = 10

[tool_servers.search]
transport = { type = "http", url = "http://localhost:9000/mcp" }
headers = { Authorization = "Bearer abc" }

[agents.writer]
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let files = &config.tool_servers["files"];
        assert_eq!(files.kind(), TransportKind::Stdio);
        assert_eq!(files.identity(), "stdio:npx -y fs-server");
        assert_eq!(files.timeout_secs, Some(10));

        let search = &config.tool_servers["search"];
        assert_eq!(search.identity(), "http:http://localhost:9000/mcp");
        assert_eq!(search.headers["Authorization"], "Bearer abc");

        let writer = &config.agents["writer"];
        assert_eq!(writer.provider, "anthropic");
        assert_eq!(writer.max_tokens, 8192);
    }

    #[test]
    fn test_step_backoff() {
        let engine = EngineConfig::default();
        let policy = engine.step_backoff(2);
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, 500);
    }

    #[test]
    fn test_gateway_roles() {
        let toml_str = r#"
[gateway]
token = "my-token"

[[gateway.api_keys]]
name = "dash"
key = "fk_abc"
role = "viewer"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let gw = config.gateway.unwrap();
        assert_eq!(gw.bind, "127.0.0.1:18790");
        assert_eq!(gw.api_keys[0].role, ApiKeyRole::Viewer);
        assert!(ApiKeyRole::Viewer < ApiKeyRole::Operator);
    }
}
