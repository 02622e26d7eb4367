use std::sync::Arc;

use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{Value, json};

use crate::config::{LlmProvider, ModelSettings};
use crate::cost::TokenUsage;
use crate::error::PipelineError;
use crate::http::{RateLimiter, RateLimits, is_retryable_error, is_retryable_status};

const OPENAI_BASE: &str = "https://api.openai.com";
const ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

pub trait LlmClient: Send + Sync {
    fn settings(&self) -> &ModelSettings;
    fn complete(&self, system: &str, user: &str) -> Result<Completion, PipelineError>;
}

impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    fn settings(&self) -> &ModelSettings {
        (**self).settings()
    }

    fn complete(&self, system: &str, user: &str) -> Result<Completion, PipelineError> {
        (**self).complete(system, user)
    }
}

fn provider_error(provider: LlmProvider, message: String, retryable: bool) -> PipelineError {
    PipelineError::Provider {
        provider: provider.as_str().to_string(),
        message,
        retryable,
    }
}

fn send_json(
    provider: LlmProvider,
    limiter: &RateLimiter,
    request: RequestBuilder,
) -> Result<Value, PipelineError> {
    limiter.acquire();
    let response = request
        .send()
        .map_err(|err| provider_error(provider, err.to_string(), is_retryable_error(&err)))?;
    let status = response.status().as_u16();
    if !response.status().is_success() {
        let body = response
            .text()
            .map(|body| body.chars().take(300).collect::<String>())
            .unwrap_or_default();
        return Err(provider_error(
            provider,
            format!("status {status}: {body}"),
            is_retryable_status(status),
        ));
    }
    response
        .json::<Value>()
        .map_err(|err| provider_error(provider, err.to_string(), false))
}

fn token_count(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    settings: ModelSettings,
    limiter: Arc<RateLimiter>,
}

impl OpenAiClient {
    pub fn new(
        client: Client,
        api_key: String,
        settings: ModelSettings,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| OPENAI_BASE.to_string());
        Self {
            client,
            api_key,
            base_url,
            settings,
            limiter,
        }
    }
}

impl LlmClient for OpenAiClient {
    fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    fn complete(&self, system: &str, user: &str) -> Result<Completion, PipelineError> {
        let body = json!({
            "model": self.settings.model,
            "temperature": 0,
            "max_tokens": self.settings.max_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body);
        let value = send_json(LlmProvider::OpenAi, &self.limiter, request)?;
        let text = value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                provider_error(
                    LlmProvider::OpenAi,
                    "response has no message content".to_string(),
                    false,
                )
            })?
            .to_string();
        let usage = value.get("usage").cloned().unwrap_or(Value::Null);
        Ok(Completion {
            text,
            usage: TokenUsage {
                prompt_tokens: token_count(&usage, "prompt_tokens"),
                completion_tokens: token_count(&usage, "completion_tokens"),
            },
        })
    }
}

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    settings: ModelSettings,
    limiter: Arc<RateLimiter>,
}

impl AnthropicClient {
    pub fn new(
        client: Client,
        api_key: String,
        settings: ModelSettings,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let base_url =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| ANTHROPIC_BASE.to_string());
        Self {
            client,
            api_key,
            base_url,
            settings,
            limiter,
        }
    }
}

impl LlmClient for AnthropicClient {
    fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    fn complete(&self, system: &str, user: &str) -> Result<Completion, PipelineError> {
        let body = json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": 0,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });
        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        let value = send_json(LlmProvider::Anthropic, &self.limiter, request)?;
        let text = value
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                    .find_map(|block| block.get("text").and_then(Value::as_str))
            })
            .ok_or_else(|| {
                provider_error(
                    LlmProvider::Anthropic,
                    "response has no text block".to_string(),
                    false,
                )
            })?
            .to_string();
        let usage = value.get("usage").cloned().unwrap_or(Value::Null);
        Ok(Completion {
            text,
            usage: TokenUsage {
                prompt_tokens: token_count(&usage, "input_tokens"),
                completion_tokens: token_count(&usage, "output_tokens"),
            },
        })
    }
}

fn api_key_var(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "OPENAI_API_KEY",
        LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
    }
}

/// Builds the client for one tier, or `None` when the provider has no API key.
pub fn client_for(
    client: &Client,
    settings: &ModelSettings,
    limits: &RateLimits,
) -> Option<Box<dyn LlmClient>> {
    let var = api_key_var(settings.provider);
    let Some(api_key) = std::env::var(var)
        .ok()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
    else {
        tracing::warn!("{var} is not set; {} is unavailable", settings.key());
        return None;
    };
    let limiter = limits.for_provider(settings.provider);
    let boxed: Box<dyn LlmClient> = match settings.provider {
        LlmProvider::OpenAi => Box::new(OpenAiClient::new(
            client.clone(),
            api_key,
            settings.clone(),
            limiter,
        )),
        LlmProvider::Anthropic => Box::new(AnthropicClient::new(
            client.clone(),
            api_key,
            settings.clone(),
            limiter,
        )),
    };
    Some(boxed)
}
