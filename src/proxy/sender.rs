//! Upstream transport
//!
//! The tap only needs "send this request, give me a status, headers and a
//! body stream back". `HttpSender` does that with a pooled reqwest client;
//! tests swap in a canned sender.

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;

use super::types::{Headers, ProxyRequest, ProxyResponse};

/// Performs the upstream call for a normalized request
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, request: ProxyRequest) -> Result<ProxyResponse>;
}

/// Request headers the client computes itself
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "connection", "transfer-encoding"];

/// Sender backed by a shared reqwest client
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSender {
    /// Build a sender for `base_url` with a whole-exchange `timeout`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join base URL and path with exactly one `/` between them
    fn target_url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, path)
        }
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let url = self.target_url(&request.path);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .with_context(|| format!("Invalid HTTP method {:?}", request.method))?;

        let mut builder = self.client.request(method, &url);
        for (name, values) in &request.headers {
            if SKIPPED_REQUEST_HEADERS
                .iter()
                .any(|skip| name.eq_ignore_ascii_case(skip))
            {
                continue;
            }
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        if let Some(body) = request.body {
            let bytes = body
                .into_bytes(usize::MAX)
                .await
                .context("Failed to read request body")?;
            builder = builder.body(bytes);
        }

        tracing::debug!(%url, "Forwarding request upstream");

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to forward request to {}", url))?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(io::Error::other))
            .boxed();

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

/// Convert an http header map into the multimap form, lossy on non-UTF-8 values
pub fn collect_headers(map: &reqwest::header::HeaderMap) -> Headers {
    let mut headers = Headers::with_capacity(map.keys_len());
    for (name, value) in map {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::types::first_header;
    use futures::TryStreamExt;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_target_url_single_slash() {
        let sender = HttpSender::new("https://api.example.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            sender.target_url("/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(sender.target_url("v1/models?x=1"), "https://api.example.com/v1/models?x=1");
        assert_eq!(sender.target_url("/"), "https://api.example.com");

        let bare = HttpSender::new("http://localhost:9000", Duration::from_secs(5)).unwrap();
        assert_eq!(bare.target_url("/a"), "http://localhost:9000/a");
    }

    #[tokio::test]
    async fn test_send_forwards_request_and_streams_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(query_param("stream", "true"))
            .and(header("authorization", "Bearer fake-token"))
            .and(body_string(r#"{"model":"gpt-4"}"#))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: [DONE]\n\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sender = HttpSender::new(server.uri(), Duration::from_secs(5)).unwrap();
        let request = ProxyRequest::new("POST", "/v1/chat/completions?stream=true")
            .with_header("Authorization", "Bearer fake-token")
            .with_header("Host", "localhost:8090")
            .with_body(r#"{"model":"gpt-4"}"#);

        let response = sender.send(request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            first_header(&response.headers, "content-type"),
            Some("text/event-stream")
        );

        let body = response
            .body
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .concat();
        assert_eq!(body, b"data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_not_a_send_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let sender = HttpSender::new(server.uri(), Duration::from_secs(5)).unwrap();
        let response = sender.send(ProxyRequest::new("GET", "/v1/models")).await.unwrap();
        assert_eq!(response.status, 429);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_fails() {
        // Port 9 (discard) is not listening in test environments
        let sender = HttpSender::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = sender.send(ProxyRequest::new("GET", "/")).await.unwrap_err();
        assert!(err.to_string().contains("Failed to forward request"));
    }

    #[tokio::test]
    async fn test_invalid_method_rejected() {
        let sender = HttpSender::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = sender
            .send(ProxyRequest::new("BAD METHOD", "/"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid HTTP method"));
    }
}
