use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use tokio::sync::mpsc;

use crate::context::RequestContext;
use crate::types::{CompletionRequest, CompletionResponse, StreamChunk};
use crate::Result;

pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// A registered LLM backend: an identity plus buffered and streaming
/// completion calls. Implementations own their upstream client and never
/// compute cost; pricing is the gateway's concern.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        cx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse>;

    async fn stream(&self, cx: &RequestContext, request: &CompletionRequest)
        -> Result<ChunkStream>;

    fn is_model_supported(&self, model: &str) -> bool;

    fn supported_models(&self) -> Vec<String>;
}

/// Adapts the receiving half of a bridge channel into a [`ChunkStream`].
/// The stream closes when the producer task drops its sender.
pub(crate) fn channel_stream(rx: mpsc::Receiver<Result<StreamChunk>>) -> ChunkStream {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}
