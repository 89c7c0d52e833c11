use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowrun_core::config::AgentConfig;
use flowrun_core::error::AgentError;

use super::{classify_status, CompletionClient};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl CompletionClient for OpenAiClient {
    fn complete(
        &self,
        config: &AgentConfig,
        system: Option<String>,
        task: String,
    ) -> BoxFuture<'_, Result<String, AgentError>> {
        let config = config.clone();

        Box::pin(async move {
            let url = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);

            // o-series models reject temperature
            let is_o_series = config.model_id.starts_with("o1")
                || config.model_id.starts_with("o3")
                || config.model_id.starts_with("o4");

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(OaiMessage {
                    role: "system".to_string(),
                    content: system,
                });
            }
            messages.push(OaiMessage {
                role: "user".to_string(),
                content: task,
            });

            let body = ChatRequest {
                model: config.model_id.clone(),
                messages,
                max_tokens: config.max_tokens,
                temperature: if is_o_series || config.temperature <= 0.0 {
                    None
                } else {
                    Some(config.temperature)
                },
            };

            let mut req = self.http.post(url).json(&body);
            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| AgentError::Provider(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(classify_status(status, &body));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| AgentError::Provider(format!("Invalid response body: {}", e)))?;

            if let Some(usage) = parsed.usage {
                debug!(
                    input_tokens = usage.prompt_tokens,
                    output_tokens = usage.completion_tokens,
                    "Token usage"
                );
            }

            let choice = parsed
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| AgentError::Provider("Response contained no choices".into()))?;
            debug!(finish_reason = ?choice.finish_reason, "Completion finished");
            Ok(choice.message.content.unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: String) -> AgentConfig {
        AgentConfig {
            provider: "openai".into(),
            model_id: "gpt-test".into(),
            api_key: Some("sk-oai".into()),
            base_url: Some(url),
            max_tokens: 128,
            temperature: 0.2,
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn test_complete_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-oai")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "gpt-test",
                "messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "summarize"}
                ]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"summary"},"finish_reason":"stop"}],
                    "usage":{"prompt_tokens":5,"completion_tokens":1}}"#,
            )
            .create_async()
            .await;

        let out = OpenAiClient::new()
            .complete(
                &config(format!("{}/v1/chat/completions", server.url())),
                Some("sys".into()),
                "summarize".into(),
            )
            .await
            .unwrap();
        assert_eq!(out, "summary");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let err = OpenAiClient::new()
            .complete(
                &config(format!("{}/v1/chat/completions", server.url())),
                None,
                "t".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
        assert!(err.is_retryable());
    }
}
