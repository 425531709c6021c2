use std::time::Duration;

use futures_util::StreamExt;
use httpmock::prelude::*;
use serde_json::json;

use calcifer::providers::{OpenAiConfig, OpenAiProvider};
use calcifer::{CalciferError, CompletionRequest, Message, Provider, RequestContext};

fn provider_for(server: &MockServer) -> OpenAiProvider {
    OpenAiProvider::new(OpenAiConfig {
        api_key: "sk-test".to_string(),
        base_url: format!("{}/v1", server.base_url()),
        timeout_secs: 5,
        max_retries: 0,
    })
    .unwrap()
}

fn request() -> CompletionRequest {
    let mut request = CompletionRequest::new(
        "gpt-4",
        vec![Message::system("be brief"), Message::user("Hello")],
    );
    request.temperature = Some(0.2);
    request.max_tokens = Some(64);
    request
}

#[tokio::test]
async fn complete_translates_request_and_response() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-test")
            .json_body_partial(
                json!({
                    "model": "gpt-4",
                    "messages": [
                        {"role": "system", "content": "be brief"},
                        {"role": "user", "content": "Hello"}
                    ],
                    "temperature": 0.2,
                    "max_tokens": 64
                })
                .to_string(),
            );
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "id": "chatcmpl-123",
                "model": "gpt-4-0613",
                "choices": [
                    {"message": {"role": "assistant", "content": "Hi there!"}}
                ],
                "usage": {
                    "prompt_tokens": 12,
                    "completion_tokens": 4,
                    "total_tokens": 16
                }
            }));
    });

    let provider = provider_for(&server);
    let cx = RequestContext::new();
    let response = provider.complete(&cx, &request()).await.unwrap();

    mock.assert();
    assert_eq!(response.id, "chatcmpl-123");
    assert_eq!(response.model, "gpt-4-0613");
    assert_eq!(response.provider, "openai");
    assert_eq!(response.content, "Hi there!");
    assert_eq!(response.usage.prompt_tokens, 12);
    assert_eq!(response.usage.completion_tokens, 4);
    assert_eq!(response.usage.total_tokens, 16);
    assert_eq!(response.usage.cost, 0.0);
}

#[tokio::test]
async fn upstream_error_status_is_surfaced() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(429)
            .header("content-type", "application/json")
            .body("{\"error\":{\"message\":\"rate limited\"}}");
    });

    let provider = provider_for(&server);
    let cx = RequestContext::new();
    let err = provider.complete(&cx, &request()).await.unwrap_err();
    assert!(matches!(err, CalciferError::Api { status, .. } if status.as_u16() == 429));
}

#[tokio::test]
async fn stream_bridges_sse_chunks_in_order() {
    let server = MockServer::start();
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"The\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" sky\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" is blue\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .json_body_partial(json!({"stream": true}).to_string());
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(sse_body);
    });

    let provider = provider_for(&server);
    let cx = RequestContext::new();
    let mut chunks = provider.stream(&cx, &request()).await.unwrap();

    let mut collected = Vec::new();
    while let Some(item) = chunks.next().await {
        collected.push(item.unwrap());
    }

    assert_eq!(collected.len(), 4);
    assert_eq!(collected[0].delta, "The");
    assert_eq!(collected[1].delta, " sky");
    assert_eq!(collected[2].delta, " is blue");
    assert!(!collected[2].done);
    assert!(collected[3].done);
    assert!(collected[3].delta.is_empty());
}

#[tokio::test]
async fn stream_consumer_cancellation_ends_the_bridge() {
    let server = MockServer::start();
    // Enough chunks that the bridge would outlive the consumer if it
    // ignored cancellation; the capacity-1 channel blocks it early.
    let mut body = String::new();
    for i in 0..200 {
        body.push_str(&format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"w{i} \"}},\"finish_reason\":null}}]}}\n\n"
        ));
    }
    body.push_str("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n");
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(body);
    });

    let provider = provider_for(&server);
    let cx = RequestContext::new();
    let mut chunks = provider.stream(&cx, &request()).await.unwrap();

    let first = chunks.next().await.unwrap().unwrap();
    let second = chunks.next().await.unwrap().unwrap();
    assert!(!first.done && !second.done);

    cx.cancel();

    let trailing = tokio::time::timeout(Duration::from_millis(100), async {
        let mut live_chunks = 0;
        let mut cancelled_error = false;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(_) => live_chunks += 1,
                Err(CalciferError::Cancelled) => cancelled_error = true,
                Err(other) => panic!("unexpected stream error: {other}"),
            }
        }
        (live_chunks, cancelled_error)
    })
    .await
    .expect("bridge did not close within 100ms of cancellation");

    assert!(trailing.0 <= 1, "got {} chunks after cancellation", trailing.0);
    let _ = trailing.1;
}

#[tokio::test]
async fn stream_without_finish_reason_closes_on_done_sentinel() {
    let server = MockServer::start();
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"only\"},\"finish_reason\":null}]}\n\n",
        "data: [DONE]\n\n",
    );
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(sse_body);
    });

    let provider = provider_for(&server);
    let cx = RequestContext::new();
    let mut chunks = provider.stream(&cx, &request()).await.unwrap();

    assert_eq!(chunks.next().await.unwrap().unwrap().delta, "only");
    assert!(chunks.next().await.is_none());
}

#[tokio::test]
async fn buffered_call_retries_transport_errors() {
    // A connection to a closed port fails at the transport layer; with
    // max_retries the adapter retries the same request before giving up.
    let provider = OpenAiProvider::new(OpenAiConfig {
        api_key: "sk-test".to_string(),
        base_url: "http://127.0.0.1:1/v1".to_string(),
        timeout_secs: 1,
        max_retries: 1,
    })
    .unwrap();

    let cx = RequestContext::new();
    let err = provider.complete(&cx, &request()).await.unwrap_err();
    assert!(matches!(err, CalciferError::Http(_)));
}
