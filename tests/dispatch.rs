//! End-to-end dispatch tests against mock upstreams.

mod common;

use common::*;
use model_proxy::metrics::{MetricsCollector, TimeWindow};
use model_proxy::store::ActiveRequestStore;
use serde_json::json;
use std::time::Duration;

fn chat_body(model: &str) -> serde_json::Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}]
    })
}

#[tokio::test]
async fn test_non_streaming_proxy_success() {
    let upstream = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: json!({"id": "cmpl-1", "choices": [{"message": {"content": "hello"}}]}).to_string(),
    })
    .await;
    let app = spawn_app(config(vec![model("gpt-4", vec![backend("a", upstream)])])).await;

    let response = app.post(chat_body("gpt-4")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["id"], "cmpl-1");

    settle().await;
    // slot released, success metric recorded with ttft == duration
    assert_eq!(app.store.get_count("a").await.unwrap(), 0);
    let stats = app
        .state
        .metrics
        .get_stats("a", TimeWindow::last_minutes(5))
        .await;
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.non_streaming_ttft_samples, 1);
}

#[tokio::test]
async fn test_streaming_proxy_success() {
    let upstream = start_mock_backend(MockBehavior::Streaming {
        first_byte_delay: Duration::from_millis(5),
        chunks: vec![
            "data: {\"delta\":\"he\"}\n\n".into(),
            "data: {\"delta\":\"llo\"}\n\n".into(),
            "data: [DONE]\n\n".into(),
        ],
    })
    .await;
    let app = spawn_app(config(vec![model("gpt-4", vec![backend("a", upstream)])])).await;

    let mut body = chat_body("gpt-4");
    body["stream"] = json!(true);
    let response = app.post(body).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("\"delta\":\"he\""));
    assert!(text.contains("data: [DONE]"));

    settle().await;
    assert_eq!(app.store.get_count("a").await.unwrap(), 0);
    let stats = app
        .state
        .metrics
        .get_stats("a", TimeWindow::last_minutes(5))
        .await;
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.streaming_ttft_samples, 1);
}

#[tokio::test]
async fn test_precondition_errors() {
    let upstream = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: "{}".into(),
    })
    .await;
    let app = spawn_app(config(vec![model("gpt-4", vec![backend("a", upstream)])])).await;

    // missing model field
    let response = app.post(json!({"messages": []})).send().await.unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "model_required");

    // unparseable body
    let response = app
        .client
        .post(app.url())
        .bearer_auth("caller-key")
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_request");

    // missing bearer
    let response = app
        .client
        .post(app.url())
        .json(&chat_body("gpt-4"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // unknown key
    let response = app
        .client
        .post(app.url())
        .bearer_auth("wrong-key")
        .json(&chat_body("gpt-4"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // model not in the caller's allow-list
    let response = app.post(chat_body("claude-3")).send().await.unwrap();
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "model_not_allowed");

    // nothing reached the upstream slot store
    assert_eq!(app.store.get_count("a").await.unwrap(), 0);
}

#[tokio::test]
async fn test_forced_backend_honored() {
    let primary = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: json!({"served_by": "a"}).to_string(),
    })
    .await;
    let pinned = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: json!({"served_by": "b"}).to_string(),
    })
    .await;
    let mut m = model("gpt-4", vec![backend("a", primary), backend("b", pinned)]);
    m.backends[0].weight = 100;
    let app = spawn_app(config(vec![m])).await;

    for _ in 0..5 {
        let response = app
            .post(chat_body("gpt-4"))
            .header("X-Backend-ID", "b")
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["served_by"], "b");
    }
}

#[tokio::test]
async fn test_forced_backend_disabled_is_a_400_with_no_side_effects() {
    let upstream = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: "{}".into(),
    })
    .await;
    let mut m = model("gpt-4", vec![backend("a", upstream), backend("b", upstream)]);
    m.backends[1].enabled = false;
    let app = spawn_app(config(vec![m])).await;

    let response = app
        .post(chat_body("gpt-4"))
        .header("X-Backend-ID", "b")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("disabled"));

    settle().await;
    // no slot taken, no metric recorded
    assert_eq!(app.store.get_count("b").await.unwrap(), 0);
    let stats = app
        .state
        .metrics
        .get_stats("b", TimeWindow::last_minutes(5))
        .await;
    assert_eq!(stats.total_requests, 0);
}

#[tokio::test]
async fn test_forced_unknown_backend_is_a_400() {
    let upstream = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: "{}".into(),
    })
    .await;
    let app = spawn_app(config(vec![model("gpt-4", vec![backend("a", upstream)])])).await;

    let response = app
        .post(chat_body("gpt-4"))
        .header("X-Backend-ID", "ghost")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_fallback_on_upstream_error() {
    let failing = start_mock_backend(MockBehavior::Json {
        status: 500,
        body: json!({"error": "boom"}).to_string(),
    })
    .await;
    let healthy = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: json!({"served_by": "b"}).to_string(),
    })
    .await;
    // weight pins initial selection to the failing backend; the healthy
    // one is fallback-only
    let mut m = model("gpt-4", vec![backend("a", failing), backend("b", healthy)]);
    m.backends[1].weight = 0;
    let app = spawn_app(config(vec![m])).await;

    let response = app.post(chat_body("gpt-4")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["served_by"], "b");

    settle().await;
    let stats_a = app
        .state
        .metrics
        .get_stats("a", TimeWindow::last_minutes(5))
        .await;
    assert_eq!(stats_a.failed_requests, 1);
    let stats_b = app
        .state
        .metrics
        .get_stats("b", TimeWindow::last_minutes(5))
        .await;
    assert_eq!(stats_b.successful_requests, 1);
    assert_eq!(app.store.get_count("a").await.unwrap(), 0);
    assert_eq!(app.store.get_count("b").await.unwrap(), 0);
}

#[tokio::test]
async fn test_exhaustion_surfaces_last_upstream_response() {
    let failing = start_mock_backend(MockBehavior::Json {
        status: 503,
        body: json!({"error": {"message": "overloaded upstream"}}).to_string(),
    })
    .await;
    let app = spawn_app(config(vec![model(
        "gpt-4",
        vec![backend("a", failing), backend("b", failing)],
    )]))
    .await;

    let response = app.post(chat_body("gpt-4")).send().await.unwrap();
    // the upstream's own diagnostics come back verbatim
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["message"], "overloaded upstream");

    settle().await;
    let all = app
        .state
        .metrics
        .get_all_stats(TimeWindow::last_minutes(5))
        .await;
    assert_eq!(all["a"].failed_requests, 1);
    assert_eq!(all["b"].failed_requests, 1);
}

#[tokio::test]
async fn test_capacity_fallback_and_429() {
    let upstream = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: json!({"served_by": "b"}).to_string(),
    })
    .await;
    let mut m = model("gpt-4", vec![backend("a", upstream), backend("b", upstream)]);
    m.backends[0].max_concurrent_requests = 1;
    m.backends[1].max_concurrent_requests = 10;
    m.backends[1].weight = 0; // a is always the initial pick
    let app = spawn_app(config(vec![m])).await;

    // occupy a's only slot
    assert!(app.store.try_record_start("a", "occupier", 1).await.unwrap());

    let response = app.post(chat_body("gpt-4")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["served_by"], "b");

    // capacity denial is not an attempt: no metric against a
    settle().await;
    let stats_a = app
        .state
        .metrics
        .get_stats("a", TimeWindow::last_minutes(5))
        .await;
    assert_eq!(stats_a.total_requests, 0);
}

#[tokio::test]
async fn test_all_backends_at_capacity_is_429() {
    let upstream = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: "{}".into(),
    })
    .await;
    let mut m = model("gpt-4", vec![backend("a", upstream)]);
    m.backends[0].max_concurrent_requests = 1;
    let app = spawn_app(config(vec![m])).await;

    assert!(app.store.try_record_start("a", "occupier", 1).await.unwrap());

    let response = app.post(chat_body("gpt-4")).send().await.unwrap();
    assert_eq!(response.status(), 429);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "all_backends_at_capacity");
}

#[tokio::test]
async fn test_no_enabled_backend_is_503() {
    let upstream = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: "{}".into(),
    })
    .await;
    let mut m = model("gpt-4", vec![backend("a", upstream)]);
    m.backends[0].enabled = false;
    let app = spawn_app(config(vec![m])).await;

    let response = app.post(chat_body("gpt-4")).send().await.unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "no_backend");
}

#[tokio::test]
async fn test_ttft_timeout_falls_back_to_streaming_peer() {
    let slow = start_mock_backend(MockBehavior::Streaming {
        first_byte_delay: Duration::from_millis(200),
        chunks: vec!["data: {\"served_by\":\"a\"}\n\n".into()],
    })
    .await;
    let fast = start_mock_backend(MockBehavior::Streaming {
        first_byte_delay: Duration::from_millis(0),
        chunks: vec!["data: {\"served_by\":\"b\"}\n\n".into()],
    })
    .await;

    let mut m = model("gpt-4", vec![backend("a", slow), backend("b", fast)]);
    m.backends[0].streaming_ttft_timeout_ms = Some(50);
    m.backends[1].weight = 0; // a is always the initial pick
    let app = spawn_app(config(vec![m])).await;

    let mut body = chat_body("gpt-4");
    body["stream"] = json!(true);
    let response = app.post(body).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("\"served_by\":\"b\""));

    settle().await;
    let stats_a = app
        .state
        .metrics
        .get_stats("a", TimeWindow::last_minutes(5))
        .await;
    assert_eq!(stats_a.failed_requests, 1);
    assert_eq!(app.store.get_count("a").await.unwrap(), 0);
    assert_eq!(app.store.get_count("b").await.unwrap(), 0);
}

#[tokio::test]
async fn test_ttft_timeout_exhaustion_is_504() {
    let slow = start_mock_backend(MockBehavior::Streaming {
        first_byte_delay: Duration::from_millis(300),
        chunks: vec!["data: late\n\n".into()],
    })
    .await;
    let mut m = model("gpt-4", vec![backend("a", slow)]);
    m.backends[0].streaming_ttft_timeout_ms = Some(40);
    let app = spawn_app(config(vec![m])).await;

    let mut body = chat_body("gpt-4");
    body["stream"] = json!(true);
    let response = app.post(body).send().await.unwrap();
    assert_eq!(response.status(), 504);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "ttft_timeout");
}

#[tokio::test]
async fn test_non_streaming_garbage_body_falls_back() {
    let garbled = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: "<html>not json</html>".into(),
    })
    .await;
    let healthy = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: json!({"served_by": "b"}).to_string(),
    })
    .await;
    let mut m = model("gpt-4", vec![backend("a", garbled), backend("b", healthy)]);
    m.backends[1].weight = 0;
    let app = spawn_app(config(vec![m])).await;

    let response = app.post(chat_body("gpt-4")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["served_by"], "b");
}

#[tokio::test]
async fn test_model_override_rewrites_upstream_body() {
    // the mock can't inspect the body, but the override path is covered by
    // unit tests; here we just prove an overridden backend still serves
    let upstream = start_mock_backend(MockBehavior::Json {
        status: 200,
        body: json!({"ok": true}).to_string(),
    })
    .await;
    let mut m = model("gpt-4", vec![backend("a", upstream)]);
    m.backends[0].model_override = Some("gpt-4-turbo".into());
    let app = spawn_app(config(vec![m])).await;

    let response = app.post(chat_body("gpt-4")).send().await.unwrap();
    assert_eq!(response.status(), 200);
}
