use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::context::RequestContext;
use crate::pricing::PricingRegistry;
use crate::provider::{channel_stream, ChunkStream, Provider};
use crate::types::{CompletionRequest, CompletionResponse, Message, StreamChunk, Usage};
use crate::{CalciferError, Result};

const PROVIDER_NAME: &str = "echo";
const MODEL_NAME: &str = "echo4";
const CHUNK_DELAY: Duration = Duration::from_millis(10);

/// Deterministic in-memory provider that echoes the request back. No network
/// calls and zero cost, so the gateway is exercisable without credentials.
pub struct EchoProvider;

impl EchoProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn complete(
        &self,
        _cx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        if !self.is_model_supported(&request.model) {
            return Err(CalciferError::NotFound(format!(
                "model {} is not supported by echo provider",
                request.model
            )));
        }

        let content = build_echo_content(&request.messages);
        let prompt_tokens = count_tokens(&content);
        let completion_tokens = prompt_tokens;

        Ok(CompletionResponse {
            id: format!("echo-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
            model: request.model.clone(),
            provider: PROVIDER_NAME.to_string(),
            content,
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
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
        if !self.is_model_supported(&request.model) {
            return Err(CalciferError::NotFound(format!(
                "model {} is not supported by echo provider",
                request.model
            )));
        }

        let content = build_echo_content(&request.messages);
        let words: Vec<String> = content.split_whitespace().map(str::to_string).collect();
        let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(1);
        let cx = cx.clone();

        tokio::spawn(async move {
            let last = words.len().saturating_sub(1);
            for (i, word) in words.into_iter().enumerate() {
                let delta = if i < last { format!("{word} ") } else { word };
                tokio::select! {
                    _ = cx.cancelled() => {
                        let _ = tx.try_send(Err(CalciferError::Cancelled));
                        return;
                    }
                    sent = tx.send(Ok(StreamChunk::delta(delta))) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                tokio::time::sleep(CHUNK_DELAY).await;
            }

            tokio::select! {
                _ = cx.cancelled() => {}
                _ = tx.send(Ok(StreamChunk::done())) => {}
            }
        });

        Ok(channel_stream(rx))
    }

    fn is_model_supported(&self, model: &str) -> bool {
        model == MODEL_NAME
    }

    fn supported_models(&self) -> Vec<String> {
        vec![MODEL_NAME.to_string()]
    }
}

/// Echo models cost nothing; the zero entry keeps the pricing table total.
pub fn register_pricing(registry: &PricingRegistry) -> Result<()> {
    registry.register(
        MODEL_NAME,
        crate::types::PricingConfig {
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
        },
    )
}

fn build_echo_content(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| format!("[{}]: {}\n", message.role, message.content))
        .collect()
}

fn count_tokens(content: &str) -> u32 {
    content.split_whitespace().count() as u32
}
