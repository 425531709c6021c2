use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::DropGuard;

use super::{CacheStatus, CompletionOutcome, Gateway};
use crate::config::CorsConfig;
use crate::context::RequestContext;
use crate::provider::ChunkStream;
use crate::types::CompletionRequest;
use crate::CalciferError;

const PROVIDER_HEADER: &str = "x-provider";
const CACHE_HEADER: &str = "x-calcifer-cache";
const CACHE_SIMILARITY_HEADER: &str = "x-calcifer-cache-similarity";
const CACHE_TIMESTAMP_HEADER: &str = "x-calcifer-cache-timestamp";
const CACHE_AGE_HEADER: &str = "x-calcifer-cache-age";

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    cors: Option<Arc<CorsConfig>>,
}

impl GatewayHttpState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            cors: None,
        }
    }

    pub fn with_cors(mut self, cors: CorsConfig) -> Self {
        self.cors = Some(Arc::new(cors));
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/v1/completions", post(handle_completions))
        .route("/health", get(health))
        .layer(middleware::from_fn(trace_requests))
        .layer(middleware::from_fn_with_state(state.clone(), apply_cors))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy" })
}

/// Generates trace/request identifiers for the request and echoes them back
/// in the response headers.
async fn trace_requests(mut request: Request, next: Next) -> Response {
    let cx = RequestContext::new();
    let trace_id = cx.trace_id.clone();
    let request_id = cx.request_id.clone();

    tracing::info!(
        trace_id,
        request_id,
        method = %request.method(),
        path = %request.uri().path(),
        "request started"
    );
    request.extensions_mut().insert(cx);

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        headers.insert(HeaderName::from_static("x-trace-id"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }
    response
}

async fn apply_cors(
    State(state): State<GatewayHttpState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(cors) = state.cors.clone() else {
        return next.run(request).await;
    };

    let origin = request.headers().get(header::ORIGIN).cloned();
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        set_cors_headers(response.headers_mut(), &cors, origin.as_ref(), true);
        return response;
    }

    let mut response = next.run(request).await;
    set_cors_headers(response.headers_mut(), &cors, origin.as_ref(), false);
    response
}

fn set_cors_headers(
    headers: &mut HeaderMap,
    cors: &CorsConfig,
    origin: Option<&HeaderValue>,
    preflight: bool,
) {
    let any = cors.allowed_origins.iter().any(|allowed| allowed == "*");
    let allowed = match origin {
        Some(origin) => {
            let matches = any
                || origin
                    .to_str()
                    .is_ok_and(|value| cors.allowed_origins.iter().any(|o| o == value));
            if !matches {
                return;
            }
            if any && !cors.allow_credentials {
                HeaderValue::from_static("*")
            } else {
                origin.clone()
            }
        }
        None if any => HeaderValue::from_static("*"),
        None => return,
    };
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allowed);

    if cors.allow_credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }

    if preflight {
        if let Ok(value) = HeaderValue::from_str(&cors.allowed_methods.join(",")) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
        }
        if let Ok(value) = HeaderValue::from_str(&cors.allowed_headers.join(",")) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
        }
        if let Ok(value) = HeaderValue::from_str(&cors.max_age.to_string()) {
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, value);
        }
    }
}

async fn handle_completions(
    State(state): State<GatewayHttpState>,
    Extension(cx): Extension<RequestContext>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Response {
    if request.model.is_empty() {
        return error_response(CalciferError::InvalidArgument(
            "model is required".to_string(),
        ));
    }

    let mut cx = cx.with_model(&request.model);
    let provider_name = headers
        .get(PROVIDER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    if let Some(name) = &provider_name {
        cx = cx.with_provider(name);
    }

    tracing::info!(
        model = %request.model,
        stream = request.stream,
        provider = provider_name.as_deref().unwrap_or(""),
        "completion request received"
    );

    if request.stream {
        return handle_stream(state, cx, provider_name, request).await;
    }

    let outcome = match &provider_name {
        Some(name) => state
            .gateway
            .complete(&cx, name, &request)
            .await
            .map(|response| CompletionOutcome {
                response,
                cache: CacheStatus::Bypass,
            }),
        None => state.gateway.complete_by_model(&cx, &request).await,
    };

    match outcome {
        Ok(outcome) => {
            tracing::info!(
                tokens = outcome.response.usage.total_tokens,
                cost = outcome.response.usage.cost,
                "completion succeeded"
            );
            let mut response = Json(&outcome.response).into_response();
            set_cache_headers(response.headers_mut(), &outcome.cache);
            response
        }
        Err(err) => {
            tracing::error!("completion failed: {err}");
            error_response(err)
        }
    }
}

async fn handle_stream(
    state: GatewayHttpState,
    cx: RequestContext,
    provider_name: Option<String>,
    request: CompletionRequest,
) -> Response {
    let chunks = match &provider_name {
        Some(name) => state.gateway.stream(&cx, name, &request).await,
        None => state.gateway.stream_by_model(&cx, &request).await,
    };
    let chunks = match chunks {
        Ok(chunks) => chunks,
        Err(err) => {
            tracing::error!("stream failed: {err}");
            return error_response(err);
        }
    };

    // The guard travels with the body stream: when the client disconnects
    // and axum drops the body, the request context cancels and the bridge
    // task exits.
    let guard = cx.cancel_on_drop();
    let body = Body::from_stream(sse_frames(chunks, guard));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn sse_frames(
    chunks: ChunkStream,
    guard: DropGuard,
) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send {
    stream::unfold(
        (chunks, guard, false),
        |(mut chunks, guard, finished)| async move {
            if finished {
                return None;
            }
            match chunks.next().await {
                None => None,
                Some(Ok(chunk)) => {
                    let frame = match serde_json::to_string(&chunk) {
                        Ok(json) => format!("data: {json}\n\n"),
                        Err(err) => format!("event: error\ndata: {err}\n\n"),
                    };
                    Some((Ok(Bytes::from(frame)), (chunks, guard, chunk.done)))
                }
                Some(Err(err)) => {
                    let frame = format!("event: error\ndata: {err}\n\n");
                    Some((Ok(Bytes::from(frame)), (chunks, guard, true)))
                }
            }
        },
    )
}

fn set_cache_headers(headers: &mut HeaderMap, status: &CacheStatus) {
    match status {
        CacheStatus::Hit {
            similarity,
            cached_at,
        } => {
            headers.insert(
                HeaderName::from_static(CACHE_HEADER),
                HeaderValue::from_static("HIT"),
            );
            if let Ok(value) = HeaderValue::from_str(&format!("{similarity:.4}")) {
                headers.insert(HeaderName::from_static(CACHE_SIMILARITY_HEADER), value);
            }
            let timestamp = cached_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            if let Ok(value) = HeaderValue::from_str(&timestamp) {
                headers.insert(HeaderName::from_static(CACHE_TIMESTAMP_HEADER), value);
            }
            let age = (chrono::Utc::now() - *cached_at).num_seconds().max(0);
            if let Ok(value) = HeaderValue::from_str(&age.to_string()) {
                headers.insert(HeaderName::from_static(CACHE_AGE_HEADER), value);
            }
        }
        CacheStatus::Miss => {
            headers.insert(
                HeaderName::from_static(CACHE_HEADER),
                HeaderValue::from_static("MISS"),
            );
        }
        CacheStatus::Bypass => {}
    }
}

fn error_response(err: CalciferError) -> Response {
    let status = match &err {
        CalciferError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: err.to_string(),
            },
        }),
    )
        .into_response()
}
