//! Proxy error types and response handling

use std::io;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use thiserror::Error;

/// Terminal failures of a tap; no event is created or saved for either
#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to read request body: {0}")]
    RequestBodyRead(#[source] io::Error),

    #[error("failed to send request upstream: {0:#}")]
    UpstreamSend(#[source] anyhow::Error),
}

/// Misuse or timeout of the start/stop state machine
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("wire is already running")]
    AlreadyRunning,

    #[error("wire is not running")]
    NotRunning,

    #[error("graceful stop timed out after {timeout:?} with {pending} observer task(s) still running")]
    StopTimeout { timeout: Duration, pending: usize },
}

/// Errors surfaced by the HTTP handler
#[derive(Debug)]
pub(crate) enum ProxyError {
    Tap(TapError),
    ResponseBuild(String),
}

impl From<TapError> for ProxyError {
    fn from(err: TapError) -> Self {
        ProxyError::Tap(err)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        // Detail goes to the log only; clients get a generic body
        let (status, message) = match self {
            ProxyError::Tap(err) => {
                tracing::error!("Tap failed: {}", err);
                (StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
            ProxyError::ResponseBuild(msg) => {
                tracing::error!("Failed to build response: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };

        Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap_or_else(|_| Response::new(Body::from("Internal error building error response")))
    }
}
