pub mod http;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::cache::SemanticCacheService;
use crate::context::RequestContext;
use crate::pricing::CostCalculator;
use crate::provider::{channel_stream, ChunkStream};
use crate::registry::ProviderRegistry;
use crate::types::{CompletionRequest, CompletionResponse, StreamChunk, Usage};
use crate::{CalciferError, Result};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Byte budget per chunk when replaying a cached response as a stream.
pub const REPLAY_CHUNK_BYTES: usize = 50;

const CACHED_STREAM_PROVIDER: &str = "cached-stream";

static STREAM_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// How the semantic cache participated in a buffered completion. The HTTP
/// boundary turns this into response headers; streaming responses never
/// surface it.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheStatus {
    Hit {
        similarity: f64,
        cached_at: DateTime<Utc>,
    },
    Miss,
    /// The cache was not consulted (disabled, or explicit provider routing).
    Bypass,
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub response: CompletionResponse,
    pub cache: CacheStatus,
}

/// Orchestrates one request pipeline: cache probe, provider routing, the
/// upstream call, cost enrichment, and the cache store. Owns no state of its
/// own; everything is a shared collaborator.
pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    cost: CostCalculator,
    cache: Option<Arc<SemanticCacheService>>,
    cache_ttl: Duration,
    replay_chunk_bytes: usize,
}

impl Gateway {
    pub fn new(registry: Arc<ProviderRegistry>, cost: CostCalculator) -> Self {
        Self {
            registry,
            cost,
            cache: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            replay_chunk_bytes: REPLAY_CHUNK_BYTES,
        }
    }

    pub fn with_cache(mut self, cache: Arc<SemanticCacheService>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_replay_chunk_bytes(mut self, bytes: usize) -> Self {
        self.replay_chunk_bytes = bytes.max(1);
        self
    }

    /// Buffered completion routed by explicit provider name. Skips the cache
    /// entirely: explicit addressing means the caller knows which backend to
    /// hit, and caching across providers would confuse accounting.
    pub async fn complete(
        &self,
        cx: &RequestContext,
        provider_name: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        if provider_name.is_empty() {
            return Err(CalciferError::InvalidArgument(
                "provider name cannot be empty".to_string(),
            ));
        }

        let provider = self.registry.get(provider_name)?;
        let mut response = provider
            .complete(cx, request)
            .await
            .map_err(|err| CalciferError::upstream(provider.name(), err))?;
        self.apply_cost(&mut response);
        Ok(response)
    }

    /// Streaming completion routed by explicit provider name; no cache.
    pub async fn stream(
        &self,
        cx: &RequestContext,
        provider_name: &str,
        request: &CompletionRequest,
    ) -> Result<ChunkStream> {
        if provider_name.is_empty() {
            return Err(CalciferError::InvalidArgument(
                "provider name cannot be empty".to_string(),
            ));
        }

        let provider = self.registry.get(provider_name)?;
        provider
            .stream(cx, request)
            .await
            .map_err(|err| CalciferError::upstream(provider.name(), err))
    }

    /// Buffered completion with model routing: cache probe, provider call,
    /// cost enrichment, cache store. Cache failures are never fatal; only a
    /// hit short-circuits the provider.
    pub async fn complete_by_model(
        &self,
        cx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<CompletionOutcome> {
        if request.model.is_empty() {
            return Err(CalciferError::InvalidArgument(
                "model cannot be empty".to_string(),
            ));
        }

        let mut cache_status = CacheStatus::Bypass;
        if let Some(cache) = &self.cache {
            match cache.get(cx, request).await {
                Ok(cached) => {
                    tracing::info!(
                        similarity = cached.similarity,
                        cached_model = %cached.response.model,
                        "cache hit, returning cached response"
                    );
                    return Ok(CompletionOutcome {
                        cache: CacheStatus::Hit {
                            similarity: cached.similarity,
                            cached_at: cached.cached_at,
                        },
                        response: cached.response,
                    });
                }
                Err(CalciferError::CacheMiss) => {
                    tracing::debug!("cache miss, calling provider");
                    cache_status = CacheStatus::Miss;
                }
                Err(err) => {
                    tracing::warn!("cache get failed, continuing without cache: {err}");
                    cache_status = CacheStatus::Miss;
                }
            }
        }

        let provider = self.registry.get_by_model(&request.model)?;
        let mut response = provider
            .complete(cx, request)
            .await
            .map_err(|err| CalciferError::upstream(provider.name(), err))?;
        self.apply_cost(&mut response);

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.set(cx, request, &response, self.cache_ttl).await {
                tracing::warn!("failed to store response in cache: {err}");
            }
        }

        Ok(CompletionOutcome {
            response,
            cache: cache_status,
        })
    }

    /// Streaming completion with model routing. A cache hit is replayed as a
    /// synthetic stream; a miss streams from the provider through a relay
    /// that accumulates the content and caches it once the stream finishes
    /// cleanly.
    pub async fn stream_by_model(
        &self,
        cx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<ChunkStream> {
        if request.model.is_empty() {
            return Err(CalciferError::InvalidArgument(
                "model cannot be empty".to_string(),
            ));
        }

        if let Some(cache) = &self.cache {
            match cache.get(cx, request).await {
                Ok(cached) => {
                    tracing::info!(
                        similarity = cached.similarity,
                        "cache hit, streaming cached response"
                    );
                    return Ok(self.replay_from_cache(cx, cached.response));
                }
                Err(CalciferError::CacheMiss) => {
                    tracing::debug!("cache miss, streaming from provider");
                }
                Err(err) => {
                    tracing::warn!("cache get failed, continuing without cache: {err}");
                }
            }
        }

        let provider = self.registry.get_by_model(&request.model)?;
        let upstream = provider
            .stream(cx, request)
            .await
            .map_err(|err| CalciferError::upstream(provider.name(), err))?;

        match &self.cache {
            Some(cache) => {
                Ok(self.relay_with_caching(cx, request.clone(), upstream, cache.clone()))
            }
            None => Ok(upstream),
        }
    }

    fn apply_cost(&self, response: &mut CompletionResponse) {
        // Upstream success must never be masked by pricing lookup issues.
        match self.cost.calculate(&response.model, &response.usage) {
            Ok(cost) => response.usage.cost = cost,
            Err(err) => {
                tracing::warn!("cost calculation failed, defaulting to zero: {err}");
                response.usage.cost = 0.0;
            }
        }
    }

    fn replay_from_cache(&self, cx: &RequestContext, response: CompletionResponse) -> ChunkStream {
        let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(1);
        let cx = cx.clone();
        let budget = self.replay_chunk_bytes;

        tokio::spawn(async move {
            for piece in chunk_content(&response.content, budget) {
                tokio::select! {
                    _ = cx.cancelled() => return,
                    sent = tx.send(Ok(StreamChunk::delta(piece))) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            tokio::select! {
                _ = cx.cancelled() => {}
                _ = tx.send(Ok(StreamChunk::done())) => {}
            }
        });

        channel_stream(rx)
    }

    fn relay_with_caching(
        &self,
        cx: &RequestContext,
        request: CompletionRequest,
        mut upstream: ChunkStream,
        cache: Arc<SemanticCacheService>,
    ) -> ChunkStream {
        let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(1);
        let cx = cx.clone();
        let ttl = self.cache_ttl;

        tokio::spawn(async move {
            let mut content = String::new();
            let mut failed = false;

            loop {
                // Biased so that an already-closed upstream is observed even
                // when the consumer cancels at end-of-stream; the terminal
                // store must not be lost to that race.
                let next = tokio::select! {
                    biased;
                    next = upstream.next() => next,
                    _ = cx.cancelled() => return,
                };
                let Some(item) = next else {
                    break;
                };

                let terminal_error = item.is_err();
                if terminal_error {
                    failed = true;
                } else if let Ok(chunk) = &item {
                    if !chunk.done {
                        content.push_str(&chunk.delta);
                    }
                }

                tokio::select! {
                    _ = cx.cancelled() => return,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }

                if terminal_error {
                    break;
                }
            }

            if failed || content.is_empty() {
                return;
            }

            let response = CompletionResponse {
                id: format!("stream-{}", STREAM_ID_SEQ.fetch_add(1, Ordering::Relaxed)),
                model: request.model.clone(),
                provider: CACHED_STREAM_PROVIDER.to_string(),
                content,
                // Token counts are not available from a stream.
                usage: Usage::default(),
                finish_time: Utc::now(),
            };

            // The request context is typically cancelled exactly when the
            // stream ends, so the terminal store runs detached from it.
            let detached = cx.detached();
            if let Err(err) = cache.set(&detached, &request, &response, ttl).await {
                tracing::warn!("failed to cache streamed response: {err}");
            } else {
                tracing::debug!(
                    content_length = response.content.len(),
                    "cached streamed response"
                );
            }
        });

        channel_stream(rx)
    }
}

/// Split on character boundaries, closing each chunk once it reaches the
/// byte budget.
fn chunk_content(content: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in content.chars() {
        current.push(ch);
        if current.len() >= budget {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
