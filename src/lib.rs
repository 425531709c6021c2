//! Calcifer - model-aware reverse proxy for LLM completion APIs.
//!
//! Clients send a provider-agnostic completion request naming only a model;
//! the gateway routes it to the right upstream provider, attaches real-time
//! USD cost from token accounting, and can short-circuit the upstream call
//! with a semantically similar cached response from a vector index.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use calcifer::{
//!     CompletionRequest, CostCalculator, Gateway, Message, PricingRegistry,
//!     ProviderRegistry, RequestContext,
//! };
//! use calcifer::providers::EchoProvider;
//!
//! #[tokio::main]
//! async fn main() -> calcifer::Result<()> {
//!     let registry = Arc::new(ProviderRegistry::new());
//!     registry.register(Arc::new(EchoProvider::new()))?;
//!
//!     let pricing = Arc::new(PricingRegistry::new());
//!     let gateway = Gateway::new(registry, CostCalculator::new(pricing));
//!
//!     let cx = RequestContext::new();
//!     let request = CompletionRequest::new("echo4", vec![Message::user("Hello")]);
//!     let outcome = gateway.complete_by_model(&cx, &request).await?;
//!     println!("{}", outcome.response.content);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod embedding;
mod error;
pub mod gateway;
pub mod pricing;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod types;
pub mod utils;

pub use cache::{SemanticCacheService, SimilaritySearch, DEFAULT_SIMILARITY_THRESHOLD};
pub use context::RequestContext;
pub use embedding::EmbeddingGenerator;
pub use error::{CalciferError, Result};
pub use gateway::http::{router, GatewayHttpState};
pub use gateway::{CacheStatus, CompletionOutcome, Gateway};
pub use pricing::{CostCalculator, PricingRegistry};
pub use provider::{ChunkStream, Provider};
pub use registry::ProviderRegistry;
pub use types::{
    CachedResponse, CompletionRequest, CompletionResponse, Message, PricingConfig, Role,
    SearchResult, StreamChunk, Usage,
};
