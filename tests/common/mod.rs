//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use model_proxy::config::schema::{
    ApiKeyConfig, BackendConfig, LoadBalancingStrategy, MinErrorRateOptions, ModelConfig,
    ProviderConfig, ProviderKind,
};
use model_proxy::config::settings::Settings;
use model_proxy::config::ProxyConfig;
use model_proxy::instance::InstanceId;
use model_proxy::store::memory::MemoryActiveRequestStore;
use model_proxy::store::ActiveRequestStore;
use model_proxy::{AppState, HttpServer};

/// How a mock upstream answers each request.
#[derive(Clone)]
pub enum MockBehavior {
    /// A buffered JSON response.
    Json { status: u16, body: String },
    /// A chunked SSE response; the first chunk is written after the delay.
    Streaming {
        first_byte_delay: Duration,
        chunks: Vec<String>,
    },
}

/// Start a mock chat-completions upstream; returns its address.
pub async fn start_mock_backend(behavior: MockBehavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let behavior = Arc::new(behavior);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let behavior = behavior.clone();
                    tokio::spawn(async move {
                        read_request(&mut socket).await;
                        match &*behavior {
                            MockBehavior::Json { status, body } => {
                                let status_text = status_text(*status);
                                let response = format!(
                                    "HTTP/1.1 {status_text}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                    body.len(),
                                    body
                                );
                                let _ = socket.write_all(response.as_bytes()).await;
                            }
                            MockBehavior::Streaming {
                                first_byte_delay,
                                chunks,
                            } => {
                                let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
                                let _ = socket.write_all(head.as_bytes()).await;
                                tokio::time::sleep(*first_byte_delay).await;
                                for chunk in chunks {
                                    let framed =
                                        format!("{:x}\r\n{}\r\n", chunk.len(), chunk);
                                    if socket.write_all(framed.as_bytes()).await.is_err() {
                                        return;
                                    }
                                    tokio::time::sleep(Duration::from_millis(5)).await;
                                }
                                let _ = socket.write_all(b"0\r\n\r\n").await;
                            }
                        }
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Read one HTTP request: headers, then content-length bytes of body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = match socket.read(&mut tmp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&tmp[..n]);
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + content_length {
                return;
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        400 => "400 Bad Request",
        404 => "404 Not Found",
        429 => "429 Too Many Requests",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

/// An openai backend pointing at a mock upstream.
pub fn backend(id: &str, addr: SocketAddr) -> BackendConfig {
    BackendConfig {
        id: id.into(),
        provider: ProviderKind::Openai,
        provider_config: ProviderConfig::Openai {
            url: format!("http://{addr}"),
            api_key: format!("sk-{id}"),
        },
        weight: 1,
        enabled: true,
        model_override: None,
        streaming_ttft_timeout_ms: None,
        non_streaming_ttft_timeout_ms: None,
        record_requests: false,
        max_concurrent_requests: 0,
    }
}

pub fn model(name: &str, backends: Vec<BackendConfig>) -> ModelConfig {
    ModelConfig {
        model: name.into(),
        provider: ProviderKind::Openai,
        backends,
        load_balancing_strategy: LoadBalancingStrategy::Weighted,
        enable_affinity: false,
        affinity_write_on_dispatch: true,
        min_error_rate_options: MinErrorRateOptions::default(),
    }
}

/// Config with one caller key ("caller-key") allowed on every model.
pub fn config(models: Vec<ModelConfig>) -> ProxyConfig {
    let names = models.iter().map(|m| m.model.clone()).collect();
    ProxyConfig {
        models,
        api_keys: vec![ApiKeyConfig {
            key: "caller-key".into(),
            description: "integration caller".into(),
            models: names,
        }],
    }
}

pub struct TestApp {
    pub addr: SocketAddr,
    pub state: AppState,
    pub store: Arc<MemoryActiveRequestStore>,
    pub client: reqwest::Client,
}

impl TestApp {
    pub fn url(&self) -> String {
        format!("http://{}/v1/chat/completions", self.addr)
    }

    pub fn admin_url(&self, path: &str) -> String {
        format!("http://{}/admin/{path}", self.addr)
    }

    /// POST a chat completion as the default caller.
    pub fn post(&self, body: serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(self.url())
            .bearer_auth("caller-key")
            .json(&body)
    }
}

/// Spin up the proxy against an in-memory slot store.
pub async fn spawn_app(config: ProxyConfig) -> TestApp {
    let settings = Settings {
        config_path: "unused.toml".into(),
        port: 0,
        admin_api_keys: vec!["admin-secret".into()],
        enable_metrics: true,
        metrics_address: None,
        redis_url: None,
    };
    let instance = InstanceId::resolve();
    let store = Arc::new(MemoryActiveRequestStore::new(instance.clone()));
    let (state, _keys) = AppState::build(
        &config,
        &settings,
        instance,
        Some(store.clone() as Arc<dyn ActiveRequestStore>),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = HttpServer::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestApp {
        addr,
        state,
        store,
        client: reqwest::Client::new(),
    }
}

/// Let spawned fire-and-forget tasks (metric appends, releases) land.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
