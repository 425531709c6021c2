//! Test doubles shared by unit and integration tests. Not part of the
//! public API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::context::RequestContext;
use crate::embedding::EmbeddingGenerator;
use crate::provider::{channel_stream, ChunkStream, Provider};
use crate::types::{
    CompletionRequest, CompletionResponse, SearchResult, StreamChunk, Usage,
};
use crate::{CalciferError, Result, SimilaritySearch};

/// Embeds text by hashing it into a fixed unit vector: identical texts map
/// to identical vectors, different texts to (almost surely) dissimilar ones.
pub struct HashEmbedder;

#[async_trait]
impl EmbeddingGenerator for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        16
    }

    async fn generate(&self, _cx: &RequestContext, text: &str) -> Result<Vec<f64>> {
        let digest = Sha256::digest(text.as_bytes());
        let mut vector: Vec<f64> = digest[..16].iter().map(|b| f64::from(*b) - 128.0).collect();
        let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

/// In-memory stand-in for the vector index with the same contract: cosine
/// similarity, threshold post-filter, best-first ordering, overwrite on
/// `index`. Failures can be injected to exercise degraded paths.
#[derive(Default)]
pub struct MemorySearch {
    records: Mutex<HashMap<String, (Vec<f64>, Vec<u8>, DateTime<Utc>)>>,
    fail: AtomicBool,
}

impl MemorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_fail(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CalciferError::InvalidResponse(
                "injected backend failure".to_string(),
            ));
        }
        Ok(())
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl SimilaritySearch for MemorySearch {
    async fn search(
        &self,
        _cx: &RequestContext,
        embedding: &[f64],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        self.check_fail()?;
        let records = self.records.lock();
        let mut results: Vec<SearchResult> = records
            .iter()
            .map(|(key, (vector, data, indexed_at))| SearchResult {
                key: key.clone(),
                similarity: cosine_similarity(embedding, vector).clamp(0.0, 1.0),
                data: data.clone(),
                indexed_at: *indexed_at,
            })
            .filter(|result| result.similarity >= threshold)
            .collect();
        results.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        results.truncate(limit);
        Ok(results)
    }

    async fn index(
        &self,
        _cx: &RequestContext,
        key: &str,
        embedding: &[f64],
        data: &[u8],
        _ttl: Duration,
    ) -> Result<()> {
        self.check_fail()?;
        self.records.lock().insert(
            key.to_string(),
            (embedding.to_vec(), data.to_vec(), Utc::now()),
        );
        Ok(())
    }
}

#[derive(Clone)]
pub enum ScriptedChunk {
    Delta(String),
    Done,
    Error(String),
}

impl ScriptedChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta(text.into())
    }
}

/// Provider double with a scripted buffered response and a scripted chunk
/// sequence. `endless` mode emits deltas forever (for cancellation tests).
pub struct ScriptedProvider {
    name: String,
    models: Vec<String>,
    response: Option<CompletionResponse>,
    complete_error: Option<String>,
    chunks: Vec<ScriptedChunk>,
    chunk_interval: Duration,
    endless: bool,
    complete_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, models: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            models: models.into_iter().map(str::to_string).collect(),
            response: None,
            complete_error: None,
            chunks: Vec::new(),
            chunk_interval: Duration::ZERO,
            endless: false,
            complete_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_response(mut self, response: CompletionResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_complete_error(mut self, message: impl Into<String>) -> Self {
        self.complete_error = Some(message.into());
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<ScriptedChunk>) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

pub fn sample_response(id: &str, model: &str, content: &str) -> CompletionResponse {
    CompletionResponse {
        id: id.to_string(),
        model: model.to_string(),
        provider: "scripted".to_string(),
        content: content.to_string(),
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost: 0.0,
        },
        finish_time: Utc::now(),
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        _cx: &RequestContext,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.complete_error {
            return Err(CalciferError::InvalidResponse(message.clone()));
        }
        self.response
            .clone()
            .ok_or_else(|| CalciferError::InvalidResponse("no scripted response".to_string()))
    }

    async fn stream(
        &self,
        cx: &RequestContext,
        _request: &CompletionRequest,
    ) -> Result<ChunkStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let chunks = self.chunks.clone();
        let interval = self.chunk_interval;
        let endless = self.endless;
        let cx = cx.clone();
        let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(1);

        tokio::spawn(async move {
            let mut sequence: Box<dyn Iterator<Item = ScriptedChunk> + Send> = if endless {
                Box::new(std::iter::repeat(ScriptedChunk::delta("tick ")))
            } else {
                Box::new(chunks.into_iter())
            };

            while let Some(scripted) = sequence.next() {
                let item = match scripted {
                    ScriptedChunk::Delta(delta) => Ok(StreamChunk::delta(delta)),
                    ScriptedChunk::Done => Ok(StreamChunk::done()),
                    ScriptedChunk::Error(message) => {
                        Err(CalciferError::InvalidResponse(message))
                    }
                };
                let terminal = match &item {
                    Ok(chunk) => chunk.done,
                    Err(_) => true,
                };

                tokio::select! {
                    _ = cx.cancelled() => return,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                if terminal {
                    return;
                }
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }
        });

        Ok(channel_stream(rx))
    }

    fn is_model_supported(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    fn supported_models(&self) -> Vec<String> {
        self.models.clone()
    }
}
