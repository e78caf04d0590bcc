//! OpenAI-compatible upstream adapter.

use axum::http::HeaderMap;

/// POST `{base}/v1/chat/completions` with the backend's bearer credential.
/// The caller's remaining headers pass through untouched.
pub fn build(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    headers: HeaderMap,
    body: Vec<u8>,
) -> reqwest::RequestBuilder {
    let endpoint = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
    client
        .post(endpoint)
        .headers(headers)
        .bearer_auth(api_key)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
}
