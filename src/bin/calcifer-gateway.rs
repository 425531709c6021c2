use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use calcifer::cache::redis::RedisVectorSearch;
use calcifer::cache::SemanticCacheService;
use calcifer::config::Config;
use calcifer::embedding::{EmbeddingGenerator as _, OpenAiEmbeddings};
use calcifer::providers::{echo, openai, EchoProvider, OpenAiProvider};
use calcifer::{CostCalculator, Gateway, GatewayHttpState, PricingRegistry, ProviderRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    let config = Config::load();

    let registry = Arc::new(ProviderRegistry::new());
    let pricing = Arc::new(PricingRegistry::new());

    // The echo provider needs no configuration and is always available.
    registry.register(Arc::new(EchoProvider::new()))?;
    echo::register_pricing(&pricing)?;

    if config.openai.api_key.trim().is_empty() {
        tracing::warn!("OPENAI_API_KEY not set, openai provider disabled");
    } else {
        registry.register(Arc::new(OpenAiProvider::new(config.openai.clone())?))?;
        openai::register_pricing(&pricing)?;
        tracing::info!("openai provider registered");
    }

    let cost = CostCalculator::new(pricing);
    let mut gateway = Gateway::new(registry, cost)
        .with_cache_ttl(Duration::from_secs(config.cache.ttl_secs));

    if config.cache.enabled {
        let embeddings = Arc::new(
            OpenAiEmbeddings::new(config.openai.api_key.clone())?
                .with_base_url(config.openai.base_url.clone())
                .with_model(config.cache.embedding_model.clone()),
        );
        let search = Arc::new(
            RedisVectorSearch::connect(
                &config.redis.url(),
                &config.redis.index_name,
                embeddings.dimension(),
            )
            .await?,
        );
        gateway = gateway.with_cache(Arc::new(SemanticCacheService::new(
            embeddings,
            search,
            config.cache.similarity_threshold,
        )));
        tracing::info!(
            threshold = config.cache.similarity_threshold,
            index = %config.redis.index_name,
            "semantic cache enabled"
        );
    } else {
        tracing::info!("semantic cache disabled");
    }

    let state = GatewayHttpState::new(Arc::new(gateway)).with_cors(config.cors.clone());
    let app = calcifer::router(state);

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("calcifer-gateway listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;
    Ok(())
}
