pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

use futures::future::BoxFuture;

use flowrun_core::config::AgentConfig;
use flowrun_core::error::AgentError;

/// A single-shot completion backend.
pub trait CompletionClient: Send + Sync + 'static {
    fn complete(
        &self,
        config: &AgentConfig,
        system: Option<String>,
        task: String,
    ) -> BoxFuture<'_, Result<String, AgentError>>;
}

/// Map a failed HTTP status to an agent error. Credential and request-shape
/// problems are permanent; throttling and server faults are transient.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> AgentError {
    let message = format!("HTTP {}: {}", status, body);
    match status.as_u16() {
        401 | 403 => AgentError::Auth(message),
        400 | 404 | 422 => AgentError::Config(message),
        _ => AgentError::Provider(message),
    }
}
