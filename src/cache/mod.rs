pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::context::RequestContext;
use crate::embedding::EmbeddingGenerator;
use crate::types::{CachedResponse, CompletionRequest, CompletionResponse, SearchResult};
use crate::{CalciferError, Result};

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Vector similarity backend. `search` returns candidates already filtered
/// by the threshold, ordered best-first; `index` overwrites the record at
/// `key`.
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn search(
        &self,
        cx: &RequestContext,
        embedding: &[f64],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SearchResult>>;

    async fn index(
        &self,
        cx: &RequestContext,
        key: &str,
        embedding: &[f64],
        data: &[u8],
        ttl: Duration,
    ) -> Result<()>;
}

/// Semantic cache over an embedding generator and a vector index. Best
/// effort by contract: every failure degrades to a miss at the gateway.
pub struct SemanticCacheService {
    embeddings: Arc<dyn EmbeddingGenerator>,
    search: Arc<dyn SimilaritySearch>,
    threshold: f64,
}

impl SemanticCacheService {
    pub fn new(
        embeddings: Arc<dyn EmbeddingGenerator>,
        search: Arc<dyn SimilaritySearch>,
        threshold: f64,
    ) -> Self {
        Self {
            embeddings,
            search,
            threshold,
        }
    }

    /// Look up a semantically similar cached response. A clean no-result
    /// outcome is the distinguished [`CalciferError::CacheMiss`]; anything
    /// else is an infrastructure failure.
    pub async fn get(
        &self,
        cx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<CachedResponse> {
        let query_text = build_query_text(request);
        let embedding = self.embeddings.generate(cx, &query_text).await?;
        tracing::debug!(
            dimension = embedding.len(),
            threshold = self.threshold,
            "semantic cache lookup"
        );

        let results = self
            .search
            .search(cx, &embedding, self.threshold, 1)
            .await?;
        let Some(hit) = results.into_iter().next() else {
            return Err(CalciferError::CacheMiss);
        };

        let mut response: CompletionResponse = serde_json::from_slice(&hit.data)?;
        // Cache hits are free by contract; the gateway and the HTTP boundary
        // both rely on this.
        response.usage.cost = 0.0;

        tracing::debug!(similarity = hit.similarity, key = %hit.key, "semantic cache hit");
        Ok(CachedResponse {
            response,
            cached_at: hit.indexed_at,
            original_model: request.model.clone(),
            similarity: hit.similarity,
        })
    }

    /// Store a response under the request's fingerprint. Repeated sets for
    /// the same fingerprint overwrite the record.
    pub async fn set(
        &self,
        cx: &RequestContext,
        request: &CompletionRequest,
        response: &CompletionResponse,
        ttl: Duration,
    ) -> Result<()> {
        let query_text = build_query_text(request);
        let embedding = self.embeddings.generate(cx, &query_text).await?;
        let data = serde_json::to_vec(response)?;
        let key = cache_key(&query_text);

        tracing::debug!(key = %key, data_size = data.len(), "indexing response in cache");
        self.search.index(cx, &key, &embedding, &data, ttl).await
    }
}

/// Deterministic fingerprint of a request. Sampling parameters and metadata
/// are deliberately excluded so equivalent prompts share a cache entry.
pub(crate) fn build_query_text(request: &CompletionRequest) -> String {
    let messages = request
        .messages
        .iter()
        .map(|message| format!("{}: {}", message.role, message.content))
        .collect::<Vec<_>>()
        .join(" ");
    format!("model: {} | messages: {}", request.model, messages)
}

pub(crate) fn cache_key(query_text: &str) -> String {
    let digest = Sha256::digest(query_text.as_bytes());
    format!("cache:{digest:x}")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{Message, Usage};
    use crate::utils::test_support::{HashEmbedder, MemorySearch};

    fn request(content: &str) -> CompletionRequest {
        CompletionRequest::new("gpt-4", vec![Message::user(content)])
    }

    fn response(id: &str, content: &str, cost: f64) -> CompletionResponse {
        CompletionResponse {
            id: id.to_string(),
            model: "gpt-4".to_string(),
            provider: "openai".to_string(),
            content: content.to_string(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
                cost,
            },
            finish_time: Utc::now(),
        }
    }

    fn service() -> SemanticCacheService {
        SemanticCacheService::new(
            Arc::new(HashEmbedder),
            Arc::new(MemorySearch::default()),
            DEFAULT_SIMILARITY_THRESHOLD,
        )
    }

    #[test]
    fn query_text_is_deterministic() {
        let mut req = CompletionRequest::new(
            "gpt-4",
            vec![Message::system("be brief"), Message::user("Hello")],
        );
        req.temperature = Some(0.9);
        req.max_tokens = Some(128);
        req.metadata.insert("tenant".to_string(), "a".to_string());

        assert_eq!(
            build_query_text(&req),
            "model: gpt-4 | messages: system: be brief user: Hello"
        );

        // Sampling parameters do not influence the fingerprint.
        let mut other = req.clone();
        other.temperature = Some(0.1);
        other.max_tokens = None;
        other.metadata.clear();
        assert_eq!(build_query_text(&req), build_query_text(&other));
    }

    #[test]
    fn cache_key_is_prefixed_sha256_hex() {
        let key = cache_key("model: gpt-4 | messages: user: Hello");
        assert!(key.starts_with("cache:"));
        assert_eq!(key.len(), "cache:".len() + 64);
        assert!(key["cache:".len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, cache_key("model: gpt-4 | messages: user: Hello"));
    }

    #[tokio::test]
    async fn empty_cache_returns_miss_sentinel() {
        let cache = service();
        let cx = RequestContext::new();
        let err = cache.get(&cx, &request("Hello")).await.unwrap_err();
        assert!(err.is_cache_miss());
    }

    #[tokio::test]
    async fn set_then_get_round_trips_and_zeroes_cost() {
        let cache = service();
        let cx = RequestContext::new();
        let req = request("Hello");

        cache
            .set(&cx, &req, &response("resp-1", "Hi!", 0.0003), Duration::from_secs(60))
            .await
            .unwrap();

        let hit = cache.get(&cx, &req).await.unwrap();
        assert_eq!(hit.response.id, "resp-1");
        assert_eq!(hit.response.content, "Hi!");
        assert_eq!(hit.response.usage.cost, 0.0);
        assert!(hit.similarity >= DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(hit.original_model, "gpt-4");
    }

    #[tokio::test]
    async fn set_for_same_fingerprint_overwrites() {
        let cache = service();
        let cx = RequestContext::new();
        let req = request("Hello");

        cache
            .set(&cx, &req, &response("resp-1", "first", 0.0), Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set(&cx, &req, &response("resp-2", "second", 0.0), Duration::from_secs(60))
            .await
            .unwrap();

        let hit = cache.get(&cx, &req).await.unwrap();
        assert_eq!(hit.response.id, "resp-2");
        assert_eq!(hit.response.content, "second");
    }

    #[tokio::test]
    async fn dissimilar_request_misses() {
        let cache = service();
        let cx = RequestContext::new();

        cache
            .set(
                &cx,
                &request("What is the capital of France?"),
                &response("resp-1", "Paris", 0.0),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let err = cache
            .get(&cx, &request("zzz entirely unrelated zzz"))
            .await
            .unwrap_err();
        assert!(err.is_cache_miss());
    }

    #[tokio::test]
    async fn response_payload_round_trips_through_serialization() {
        let original = response("resp-42", "round trip", 0.125);
        let bytes = serde_json::to_vec(&original).unwrap();
        let decoded: CompletionResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, original);
    }
}
