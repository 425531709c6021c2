use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::util::ServiceExt;

use calcifer::config::CorsConfig;
use calcifer::utils::test_support::{
    sample_response, HashEmbedder, MemorySearch, ScriptedChunk, ScriptedProvider,
};
use calcifer::{
    CompletionRequest, CompletionResponse, CostCalculator, Gateway, GatewayHttpState, Message,
    PricingConfig, PricingRegistry, ProviderRegistry, RequestContext, SemanticCacheService,
    StreamChunk, DEFAULT_SIMILARITY_THRESHOLD,
};

struct Fixture {
    app: axum::Router,
    cache: Arc<SemanticCacheService>,
}

fn fixture(provider: ScriptedProvider, with_cache: bool) -> Fixture {
    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::new(provider)).unwrap();

    let pricing = Arc::new(PricingRegistry::new());
    pricing
        .register(
            "gpt-4",
            PricingConfig {
                input_cost_per_1k: 0.03,
                output_cost_per_1k: 0.06,
            },
        )
        .unwrap();

    let cache = Arc::new(SemanticCacheService::new(
        Arc::new(HashEmbedder),
        Arc::new(MemorySearch::new()),
        DEFAULT_SIMILARITY_THRESHOLD,
    ));

    let mut gateway = Gateway::new(registry, CostCalculator::new(pricing));
    if with_cache {
        gateway = gateway.with_cache(cache.clone());
    }

    let state = GatewayHttpState::new(Arc::new(gateway)).with_cors(CorsConfig::default());
    Fixture {
        app: calcifer::router(state),
        cache,
    }
}

fn completion_request(model: &str) -> CompletionRequest {
    CompletionRequest::new(model, vec![Message::user("Hello")])
}

fn post_completions(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn request_body(model: &str, stream: bool) -> serde_json::Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": stream
    })
}

#[tokio::test]
async fn health_reports_healthy() {
    let fx = fixture(ScriptedProvider::new("openai", vec!["gpt-4"]), false);

    let response = fx
        .app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed, json!({"status": "healthy"}));
}

#[tokio::test]
async fn buffered_miss_sets_miss_header_and_enriches_cost() {
    let mut upstream = sample_response("resp-1", "gpt-4", "Hi!");
    upstream.usage.prompt_tokens = 1000;
    upstream.usage.completion_tokens = 500;
    let fx = fixture(
        ScriptedProvider::new("openai", vec!["gpt-4"]).with_response(upstream),
        true,
    );

    let response = fx
        .app
        .oneshot(post_completions(request_body("gpt-4", false)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-calcifer-cache").unwrap(), "MISS");
    assert!(response.headers().get("x-calcifer-cache-similarity").is_none());
    assert!(response.headers().get("x-calcifer-cache-timestamp").is_none());
    assert!(response.headers().get("x-calcifer-cache-age").is_none());
    assert!(response.headers().get("x-trace-id").is_some());
    assert!(response.headers().get("x-request-id").is_some());

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: CompletionResponse = serde_json::from_slice(&body).unwrap();
    assert!((parsed.usage.cost - 0.06).abs() < 1e-9);
}

#[tokio::test]
async fn buffered_hit_sets_hit_headers_and_zero_cost() {
    let fx = fixture(ScriptedProvider::new("openai", vec!["gpt-4"]), true);

    let cx = RequestContext::new();
    let mut seeded = sample_response("resp-cached", "gpt-4", "Hi!");
    seeded.usage.cost = 0.0003;
    fx.cache
        .set(
            &cx,
            &completion_request("gpt-4"),
            &seeded,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let response = fx
        .app
        .oneshot(post_completions(request_body("gpt-4", false)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-calcifer-cache").unwrap(), "HIT");

    let similarity = response
        .headers()
        .get("x-calcifer-cache-similarity")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(similarity.len(), 6, "expected 4 decimal places: {similarity}");
    assert!(similarity.parse::<f64>().unwrap() >= DEFAULT_SIMILARITY_THRESHOLD);

    let timestamp = response
        .headers()
        .get("x-calcifer-cache-timestamp")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(chrono::DateTime::parse_from_rfc3339(&timestamp).is_ok());

    let age: i64 = response
        .headers()
        .get("x-calcifer-cache-age")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(age >= 0);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: CompletionResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.id, "resp-cached");
    assert_eq!(parsed.usage.cost, 0.0);
}

#[tokio::test]
async fn cache_disabled_means_no_cache_headers() {
    let fx = fixture(
        ScriptedProvider::new("openai", vec!["gpt-4"])
            .with_response(sample_response("resp-1", "gpt-4", "Hi!")),
        false,
    );

    let response = fx
        .app
        .oneshot(post_completions(request_body("gpt-4", false)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-calcifer-cache").is_none());
}

#[tokio::test]
async fn empty_model_is_bad_request() {
    let fx = fixture(ScriptedProvider::new("openai", vec!["gpt-4"]), false);

    let response = fx
        .app
        .oneshot(post_completions(request_body("", false)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(parsed["error"]["message"]
        .as_str()
        .unwrap()
        .contains("model"));
}

#[tokio::test]
async fn unroutable_model_is_internal_error() {
    let fx = fixture(ScriptedProvider::new("openai", vec!["gpt-4"]), false);

    let response = fx
        .app
        .oneshot(post_completions(request_body("unknown-model", false)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn explicit_provider_header_bypasses_cache() {
    let fx = fixture(
        ScriptedProvider::new("openai", vec!["gpt-4"])
            .with_response(sample_response("resp-direct", "gpt-4", "direct")),
        true,
    );

    // Seed an entry that model routing would return.
    let cx = RequestContext::new();
    fx.cache
        .set(
            &cx,
            &completion_request("gpt-4"),
            &sample_response("resp-cached", "gpt-4", "cached"),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/v1/completions")
        .header("content-type", "application/json")
        .header("x-provider", "openai")
        .body(Body::from(request_body("gpt-4", false).to_string()))
        .unwrap();
    let response = fx.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-calcifer-cache").is_none());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: CompletionResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.id, "resp-direct");
}

#[tokio::test]
async fn streaming_emits_sse_frames_without_cache_headers() {
    let fx = fixture(
        ScriptedProvider::new("openai", vec!["gpt-4"]).with_chunks(vec![
            ScriptedChunk::delta("The"),
            ScriptedChunk::delta(" sky"),
            ScriptedChunk::Done,
        ]),
        true,
    );

    let response = fx
        .app
        .oneshot(post_completions(request_body("gpt-4", true)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert!(response.headers().get("x-calcifer-cache").is_none());

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let chunks: Vec<StreamChunk> = text
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].delta, "The");
    assert_eq!(chunks[1].delta, " sky");
    assert!(chunks[2].done);
}

#[tokio::test]
async fn streaming_upstream_error_emits_error_event() {
    let fx = fixture(
        ScriptedProvider::new("openai", vec!["gpt-4"]).with_chunks(vec![
            ScriptedChunk::delta("partial"),
            ScriptedChunk::Error("upstream exploded".to_string()),
        ]),
        false,
    );

    let response = fx
        .app
        .oneshot(post_completions(request_body("gpt-4", true)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("data: "));
    assert!(text.contains("event: error"));
    assert!(text.contains("upstream exploded"));
}

#[tokio::test]
async fn cors_preflight_is_answered_directly() {
    let fx = fixture(ScriptedProvider::new("openai", vec!["gpt-4"]), false);

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/v1/completions")
        .header("origin", "http://example.com")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let response = fx.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "http://example.com"
    );
    assert!(response
        .headers()
        .get("access-control-allow-methods")
        .is_some());
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-credentials")
            .unwrap(),
        "true"
    );
}
