//! Proxy server setup and the catch-all handler

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderMap, Request, Response},
    Router,
};
use futures::StreamExt;
use tokio::net::TcpListener;

use super::error::ProxyError;
use super::trace::trace_id_from_headers;
use super::types::{Headers, ProxyRequest, RequestBody};
use super::wire::{Tapped, Wire};

/// Upstream response headers that belong to the upstream connection
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["transfer-encoding", "connection"];

/// Shared state for the proxy handler
#[derive(Clone)]
pub struct ProxyState {
    wire: Arc<Wire>,
}

/// Router sending every method and path through the wire
pub fn router(wire: Arc<Wire>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .with_state(ProxyState { wire })
}

/// Serve the proxy on `bind_addr` until `shutdown_rx` fires
pub async fn start_proxy(
    bind_addr: SocketAddr,
    wire: Arc<Wire>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let app = router(wire);

    tracing::info!("Starting proxy on {}", bind_addr);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    tracing::info!("Proxy listening on {}", bind_addr);

    // Stop accepting on shutdown and let open responses finish
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}

/// Main proxy handler - taps and forwards all requests
async fn proxy_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let trace_id = trace_id_from_headers(req.headers());
    let (parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    tracing::debug!(trace_id = %trace_id, "Proxying {} {}", parts.method, path);

    let body = if body.is_end_stream() {
        None
    } else {
        let stream = body
            .into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other))
            .boxed();
        Some(RequestBody::Streaming(stream))
    };

    let request = ProxyRequest {
        method: parts.method.as_str().to_string(),
        path,
        headers: to_multimap(&parts.headers),
        body,
    };

    // Handle dropped: the observer finishes and saves on its own
    let Tapped { response, .. } = state.wire.tap(trace_id, request).await?;

    let mut builder = Response::builder().status(response.status);
    for (name, values) in &response.headers {
        if SKIPPED_RESPONSE_HEADERS
            .iter()
            .any(|skip| name.eq_ignore_ascii_case(skip))
        {
            continue;
        }
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }

    builder
        .body(Body::from_stream(response.body))
        .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
}

/// Inbound headers as a multimap, lossy on non-UTF-8 values
fn to_multimap(map: &HeaderMap) -> Headers {
    let mut headers = Headers::with_capacity(map.keys_len());
    for (name, value) in map {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    headers
}
