//! Anthropic-backed invoker via rig-core.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use rig::client::CompletionClient;
use rig::completion::{AssistantContent, CompletionModel as _};
use tracing::{Instrument, warn};

use super::{Invocation, Invoker};
use crate::config::secrets::{ExposeSecret, SecretString};
use crate::telemetry::genai::{record_token_usage, start_chat_span};
use crate::telemetry::metrics;

const PROVIDER: &str = "anthropic";
const MAX_TOKENS: u64 = 4096;

/// Create an Anthropic client from a secret API key.
///
/// # Errors
/// Returns an error if the underlying HTTP client cannot be constructed.
pub fn anthropic_client(
    api_key: &SecretString,
) -> Result<rig::providers::anthropic::Client, rig::http_client::Error> {
    rig::providers::anthropic::Client::new(api_key.expose_secret())
}

/// Sends each prompt as a single-turn completion.
pub struct AnthropicInvoker {
    client: rig::providers::anthropic::Client,
    model: String,
}

impl AnthropicInvoker {
    pub fn new(api_key: &SecretString, model: impl Into<String>) -> crate::error::Result<Self> {
        let client = anthropic_client(api_key)
            .map_err(|e| crate::error::Error::Config(format!("anthropic client: {e}")))?;
        Ok(Self {
            client,
            model: model.into(),
        })
    }
}

#[async_trait]
impl Invoker for AnthropicInvoker {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn invoke(&self, prompt: &str, timeout: Duration) -> Invocation {
        let span = start_chat_span(&self.model, PROVIDER);
        let model = self.client.completion_model(&self.model);
        let request = model
            .completion_request(prompt)
            .max_tokens(MAX_TOKENS)
            .send();

        let response = match tokio::time::timeout(timeout, request.instrument(span.clone())).await
        {
            Err(_) => {
                warn!(model = %self.model, timeout_secs = timeout.as_secs(), "model call timed out");
                return Invocation::failed(format!(
                    "model call exceeded {}s timeout",
                    timeout.as_secs()
                ));
            }
            Ok(Err(e)) => return Invocation::failed(format!("model call failed: {e}")),
            Ok(Ok(response)) => response,
        };

        let usage = response.usage;
        record_token_usage(&span, usage.input_tokens, usage.output_tokens);
        for (direction, tokens) in [("input", usage.input_tokens), ("output", usage.output_tokens)]
        {
            metrics::llm_tokens().add(
                tokens,
                &[
                    KeyValue::new("model", self.model.clone()),
                    KeyValue::new("provider", PROVIDER),
                    KeyValue::new("direction", direction),
                ],
            );
        }

        let text = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        let usage = serde_json::json!({
            "model": self.model,
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
        });

        if text.trim().is_empty() {
            Invocation::failed("model returned no text").with_usage(usage)
        } else {
            Invocation::ok(text).with_usage(usage)
        }
    }
}
