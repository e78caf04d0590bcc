//! Upstream provider adapters.
//!
//! Each adapter turns a prepared proxy request (filtered headers + final
//! body) into a credentialed `reqwest` request for its provider. Payload
//! shape translation beyond the model name is deliberately not done here;
//! bodies pass through verbatim.

pub mod bedrock;
pub mod openai;

use crate::config::schema::ProviderConfig;
use axum::http::HeaderMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to build upstream request: {0}")]
    Request(String),
}

/// Build the upstream chat-completions request for `config`.
///
/// `headers` must already have the caller's `authorization`,
/// `content-length` and `host` stripped; provider credentials are injected
/// here.
pub fn chat_completions_request(
    client: &reqwest::Client,
    config: &ProviderConfig,
    headers: HeaderMap,
    body: Vec<u8>,
    model_id: &str,
    stream: bool,
) -> Result<reqwest::RequestBuilder, ProviderError> {
    match config {
        ProviderConfig::Openai { url, api_key } => {
            Ok(openai::build(client, url, api_key, headers, body))
        }
        ProviderConfig::Bedrock {
            region,
            access_key_id,
            secret_access_key,
        } => bedrock::build(
            client,
            region,
            access_key_id,
            secret_access_key,
            body,
            model_id,
            stream,
        ),
    }
}
