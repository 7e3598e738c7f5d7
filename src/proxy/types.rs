//! Normalized request/response types passed between the proxy layers
//!
//! These decouple the tap from both the inbound HTTP framework and the
//! upstream client: the server converts axum requests into `ProxyRequest`,
//! the sender converts `ProxyRequest` into whatever transport it uses.

use std::collections::HashMap;
use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;

/// Header multimap: name -> values in arrival order
pub type Headers = HashMap<String, Vec<String>>;

/// One-shot readable body stream
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// Request body: either still streaming from the client or already buffered
pub enum RequestBody {
    Buffered(Bytes),
    Streaming(BodyStream),
}

impl RequestBody {
    /// Read the whole body into memory, failing once it grows past `limit` bytes
    pub async fn into_bytes(self, limit: usize) -> io::Result<Bytes> {
        let mut stream = match self {
            RequestBody::Buffered(bytes) if bytes.len() > limit => return Err(too_large(limit)),
            RequestBody::Buffered(bytes) => return Ok(bytes),
            RequestBody::Streaming(stream) => stream,
        };

        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(too_large(limit));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            RequestBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

fn too_large(limit: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("request body exceeds {} bytes", limit),
    )
}

/// Inbound request as seen by the tap
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: String,
    /// Path plus optional query string, e.g. `/v1/chat/completions?x=1`
    pub path: String,
    pub headers: Headers,
    pub body: Option<RequestBody>,
}

impl ProxyRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Buffered(body.into()));
        self
    }
}

/// Upstream response; `body` is consumed exactly once
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: BodyStream,
}

impl fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Case-insensitive lookup of the first value of a header
pub fn first_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}
