pub mod openai;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::Result;

/// Produces fixed-dimension float vectors for semantic similarity. The
/// dimension is published so the vector index can be built against it.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn generate(&self, cx: &RequestContext, text: &str) -> Result<Vec<f64>>;
}

pub use openai::OpenAiEmbeddings;
