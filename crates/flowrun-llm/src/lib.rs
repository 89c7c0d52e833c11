pub mod providers;

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use tracing::debug;

use flowrun_core::config::AgentConfig;
use flowrun_core::error::AgentError;
use flowrun_core::traits::AgentProvider;
use flowrun_core::types::AgentRequest;

pub use providers::{AnthropicClient, CompletionClient, OpenAiClient};

/// Create a completion client based on the provider name.
pub fn create_client(config: &AgentConfig) -> Box<dyn CompletionClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new()),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new()),
    }
}

struct Binding {
    config: AgentConfig,
    client: Box<dyn CompletionClient>,
}

/// Routes agent steps to the configured binding by name.
pub struct AgentRouter {
    bindings: BTreeMap<String, Binding>,
}

impl AgentRouter {
    pub fn new(agents: &BTreeMap<String, AgentConfig>) -> Self {
        let bindings = agents
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    Binding {
                        client: create_client(config),
                        config: config.clone(),
                    },
                )
            })
            .collect();
        Self { bindings }
    }

    /// Register a binding with an explicit client.
    pub fn with_binding(
        mut self,
        name: &str,
        config: AgentConfig,
        client: Box<dyn CompletionClient>,
    ) -> Self {
        self.bindings
            .insert(name.to_string(), Binding { config, client });
        self
    }

    pub fn bindings(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }
}

impl AgentProvider for AgentRouter {
    fn complete(&self, request: AgentRequest) -> BoxFuture<'_, Result<String, AgentError>> {
        Box::pin(async move {
            let binding = self
                .bindings
                .get(&request.binding)
                .ok_or_else(|| AgentError::UnknownBinding(request.binding.clone()))?;

            let system = request
                .system_prompt
                .or_else(|| binding.config.system_prompt.clone());
            debug!(
                binding = %request.binding,
                provider = %binding.config.provider,
                model = %binding.config.model_id,
                "Dispatching agent request"
            );
            binding
                .client
                .complete(&binding.config, system, request.task)
                .await
        })
    }
}
