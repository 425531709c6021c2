use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::RequestContext;
use crate::pricing::PricingRegistry;
use crate::provider::{channel_stream, ChunkStream, Provider};
use crate::types::{CompletionRequest, CompletionResponse, PricingConfig, StreamChunk, Usage};
use crate::utils::http::{send_checked, send_checked_json};
use crate::{CalciferError, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const PROVIDER_NAME: &str = "openai";

const SUPPORTED_MODELS: &[&str] = &[
    "gpt-4",
    "gpt-4-turbo",
    "gpt-4-turbo-preview",
    "gpt-3.5-turbo",
    "gpt-3.5-turbo-16k",
];

#[derive(Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Adapter for the OpenAI chat-completions API. Translates between the
/// canonical request/response types and the upstream wire shape; cost stays
/// zero here and is filled in by the gateway.
pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
    supported_models: HashSet<String>,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("max_retries", &self.max_retries)
            .field("supported_models", &self.supported_models)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(CalciferError::InvalidArgument(
                "OpenAI API key is required".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url,
            api_key: config.api_key,
            max_retries: config.max_retries,
            supported_models: SUPPORTED_MODELS.iter().map(|m| m.to_string()).collect(),
        })
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_body<'a>(&self, request: &'a CompletionRequest, stream: bool) -> ChatBody<'a> {
        ChatBody {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: stream.then_some(true),
        }
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletion {
    id: String,
    model: String,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: WireChoiceMessage,
}

#[derive(Deserialize, Default)]
struct WireChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn complete(
        &self,
        cx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let body = self.build_body(request, false);

        let mut attempt = 0;
        let parsed: ChatCompletion = loop {
            let req = self
                .http
                .post(self.chat_completions_url())
                .bearer_auth(&self.api_key)
                .json(&body);
            match cx.run(send_checked_json::<ChatCompletion>(req)).await {
                Ok(parsed) => break parsed,
                Err(err @ CalciferError::Http(_)) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(attempt, "retrying OpenAI request after transport error: {err}");
                }
                Err(err) => return Err(err),
            }
        };

        tracing::debug!(
            prompt_tokens = parsed.usage.prompt_tokens,
            completion_tokens = parsed.usage.completion_tokens,
            "OpenAI completion succeeded"
        );

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(CompletionResponse {
            id: parsed.id,
            model: parsed.model,
            provider: PROVIDER_NAME.to_string(),
            content,
            usage: Usage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
                cost: 0.0,
            },
            finish_time: Utc::now(),
        })
    }

    async fn stream(
        &self,
        cx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<ChunkStream> {
        let body = self.build_body(request, true);
        let req = self
            .http
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body);
        let response = cx.run(send_checked(req)).await?;

        let mut data_stream = crate::utils::sse::sse_data_stream_from_response(response);
        // Capacity 1 so the first chunk never blocks on a consumer that has
        // not started reading yet.
        let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(1);
        let bridge_cx = cx.clone();

        tokio::spawn(async move {
            loop {
                if bridge_cx.is_cancelled() {
                    let _ = tx.try_send(Err(CalciferError::Cancelled));
                    return;
                }

                let next = tokio::select! {
                    _ = bridge_cx.cancelled() => {
                        let _ = tx.try_send(Err(CalciferError::Cancelled));
                        return;
                    }
                    next = data_stream.next() => next,
                };

                let data = match next {
                    None => return,
                    Some(Ok(data)) => data,
                    Some(Err(err)) => {
                        // Post-mortem errors are delivered best-effort; a
                        // leak-free exit wins over a guaranteed delivery.
                        let _ = tx.try_send(Err(err));
                        return;
                    }
                };

                let chunk = match serde_json::from_str::<ChatChunk>(&data) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.try_send(Err(err.into()));
                        return;
                    }
                };
                let Some(choice) = chunk.choices.into_iter().next() else {
                    continue;
                };

                let done = choice
                    .finish_reason
                    .as_deref()
                    .is_some_and(|reason| !reason.is_empty());
                let item = StreamChunk {
                    delta: choice.delta.content.unwrap_or_default(),
                    done,
                };

                tokio::select! {
                    _ = bridge_cx.cancelled() => {
                        let _ = tx.try_send(Err(CalciferError::Cancelled));
                        return;
                    }
                    sent = tx.send(Ok(item)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }

                if done {
                    return;
                }
            }
        });

        Ok(channel_stream(rx))
    }

    fn is_model_supported(&self, model: &str) -> bool {
        self.supported_models.contains(model)
    }

    fn supported_models(&self) -> Vec<String> {
        self.supported_models.iter().cloned().collect()
    }
}

// GPT-4 / GPT-4 Turbo / GPT-3.5 Turbo list prices, USD per 1K tokens.
const GPT4_PRICING: PricingConfig = PricingConfig {
    input_cost_per_1k: 0.03,
    output_cost_per_1k: 0.06,
};
const GPT4_TURBO_PRICING: PricingConfig = PricingConfig {
    input_cost_per_1k: 0.01,
    output_cost_per_1k: 0.03,
};
const GPT35_TURBO_PRICING: PricingConfig = PricingConfig {
    input_cost_per_1k: 0.0005,
    output_cost_per_1k: 0.0015,
};

/// Register OpenAI model pricing. Pricing constants live here, next to the
/// provider that knows them, so the gateway stays provider-agnostic.
pub fn register_pricing(registry: &PricingRegistry) -> Result<()> {
    registry.register("gpt-4", GPT4_PRICING)?;
    registry.register("gpt-4-turbo", GPT4_TURBO_PRICING)?;
    registry.register("gpt-3.5-turbo", GPT35_TURBO_PRICING)?;
    Ok(())
}
