//! The wire: forward a request, tee the response, save what was observed
//!
//! `Wire::tap` is the single entry point used by the HTTP handler. It returns
//! as soon as upstream answered; the response body handed back streams to the
//! client while a background task reads the mirrored copy, finalizes the
//! event and saves it under its own timeout. That task is owned by the wire,
//! not by the request, so a client hanging up never cancels a save.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;

use super::error::{LifecycleError, TapError};
use super::headers::{split_attributes, DEFAULT_ATTRIBUTE_PREFIX};
use super::lifecycle::{Lifecycle, DEFAULT_STOP_TIMEOUT};
use super::sender::Sender;
use super::sse::{is_event_stream, StreamEnd, StreamObserver, DEFAULT_MAX_LINE_BYTES, DEFAULT_MAX_RESPONSE_BYTES};
use super::tee::{pipe, TeeBody, DEFAULT_PIPE_CAPACITY};
use super::types::{ProxyRequest, ProxyResponse, RequestBody};
use crate::config::Config;
use crate::events::Event;
use crate::storage::Saver;

/// Default request buffering limit (32 MiB)
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 32 * 1024 * 1024;

/// Default bound on a single save
pub const DEFAULT_SAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for the wire
#[derive(Debug, Clone)]
pub struct WireOptions {
    /// Requests with larger bodies fail with `RequestBodyRead`
    pub max_request_bytes: usize,
    /// Reserved header prefix for caller attributes
    pub attribute_prefix: String,
    pub save_timeout: Duration,
    pub stop_timeout: Duration,
    /// Tee pipe depth, in chunks
    pub pipe_capacity: usize,
    pub max_response_bytes: usize,
    pub max_line_bytes: usize,
}

impl Default for WireOptions {
    fn default() -> Self {
        Self {
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            attribute_prefix: DEFAULT_ATTRIBUTE_PREFIX.to_string(),
            save_timeout: DEFAULT_SAVE_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl WireOptions {
    pub fn from_config(config: &Config) -> Self {
        let capture = &config.capture;
        Self {
            max_request_bytes: capture.max_request_bytes,
            attribute_prefix: capture.attribute_prefix.clone(),
            save_timeout: Duration::from_secs(capture.save_timeout_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            pipe_capacity: capture.pipe_capacity,
            max_response_bytes: capture.max_response_bytes,
            max_line_bytes: capture.max_line_bytes,
        }
    }
}

/// Result of a successful tap
#[derive(Debug)]
pub struct Tapped {
    /// Upstream status and headers with the tee'd body
    pub response: ProxyResponse,
    /// Completes once the event has been parsed and handed to the saver
    pub observer: ObserverHandle,
}

/// Completion signal of one background observer task
///
/// Dropping the handle detaches the task; it still runs to completion.
#[derive(Debug)]
pub struct ObserverHandle(JoinHandle<()>);

impl ObserverHandle {
    /// Wait for parse and save to finish, successfully or not
    pub async fn wait(self) {
        if let Err(e) = self.0.await {
            if e.is_panic() {
                tracing::error!("Observer task panicked: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

/// Tap orchestrator
pub struct Wire {
    sender: Arc<dyn Sender>,
    saver: Arc<dyn Saver>,
    options: WireOptions,
    observer: StreamObserver,
    lifecycle: Lifecycle,
}

impl Wire {
    pub fn new(sender: Arc<dyn Sender>, saver: Arc<dyn Saver>, options: WireOptions) -> Self {
        let observer = StreamObserver {
            max_response_bytes: options.max_response_bytes,
            max_line_bytes: options.max_line_bytes,
        };
        let lifecycle = Lifecycle::new(options.stop_timeout);

        Self {
            sender,
            saver,
            options,
            observer,
            lifecycle,
        }
    }

    pub fn options(&self) -> &WireOptions {
        &self.options
    }

    /// Forward `request` upstream and observe the response for telemetry.
    ///
    /// Fails only before the response exists: when the request body can't be
    /// buffered or the sender errors. No event is saved in either case.
    pub async fn tap(
        &self,
        trace_id: impl Into<String>,
        mut request: ProxyRequest,
    ) -> Result<Tapped, TapError> {
        let trace_id = trace_id.into();

        // Capture the body, then hand the sender an equivalent buffered copy
        let captured = match request.body.take() {
            Some(body) => {
                let bytes = body
                    .into_bytes(self.options.max_request_bytes)
                    .await
                    .map_err(TapError::RequestBodyRead)?;
                request.body = Some(RequestBody::Buffered(bytes.clone()));
                Some(bytes)
            }
            None => None,
        };

        let (attributes, forwarded) =
            split_attributes(std::mem::take(&mut request.headers), &self.options.attribute_prefix);
        request.headers = forwarded;

        let mut event = Event::new(trace_id.clone(), captured, attributes);

        tracing::debug!(
            trace_id = %trace_id,
            method = %request.method,
            path = %request.path,
            attributes = event.attributes.len(),
            "Tapping request"
        );

        let response = self
            .sender
            .send(request)
            .await
            .map_err(TapError::UpstreamSend)?;
        event.status_code = response.status;

        if !is_event_stream(&response.headers) {
            tracing::debug!(trace_id = %trace_id, status = response.status, "Upstream response is not an event stream");
        }

        let ProxyResponse {
            status,
            headers,
            body,
        } = response;

        let (writer, reader) = pipe(self.options.pipe_capacity);
        let close_trace_id = trace_id.clone();
        let tee = TeeBody::new(body, writer).on_close(move |summary| {
            if summary.reached_eof {
                tracing::debug!(trace_id = %close_trace_id, bytes = summary.bytes, "Response relayed");
            } else {
                tracing::warn!(
                    trace_id = %close_trace_id,
                    bytes = summary.bytes,
                    "Client closed response before end of stream"
                );
            }
        });

        let observer = self.observer;
        let saver = self.saver.clone();
        let save_timeout = self.options.save_timeout;
        let handle = self.lifecycle.spawn(async move {
            let end = observer.observe(reader, &mut event).await;
            event.finish(Utc::now());
            if end == StreamEnd::Eof {
                tracing::debug!(trace_id = %event.trace_id, "Stream ended without [DONE]");
            }
            persist(saver.as_ref(), event, save_timeout).await;
        });

        Ok(Tapped {
            response: ProxyResponse {
                status,
                headers,
                body: tee.boxed(),
            },
            observer: ObserverHandle(handle),
        })
    }

    pub fn start(&self) -> Result<(), LifecycleError> {
        self.lifecycle.start()
    }

    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.lifecycle.stop().await
    }

    /// Start, wait for `stop_signal`, then stop with draining
    pub async fn run<F>(&self, stop_signal: F) -> Result<(), LifecycleError>
    where
        F: std::future::Future<Output = ()>,
    {
        self.lifecycle.run(stop_signal).await
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Observer tasks still parsing or saving
    pub fn in_flight(&self) -> usize {
        self.lifecycle.in_flight()
    }
}

/// Save with a timeout of its own; failures are logged, never returned
async fn persist(saver: &dyn Saver, event: Event, timeout: Duration) {
    let trace_id = event.trace_id.clone();
    let model = event.model.clone();
    let tokens = event.token_count;
    let duration_ms = event.duration_ms;

    match tokio::time::timeout(timeout, saver.save(event)).await {
        Ok(Ok(())) => {
            tracing::info!(trace_id = %trace_id, model = %model, tokens, duration_ms, "Event saved");
        }
        Ok(Err(e)) => {
            tracing::error!(trace_id = %trace_id, "Failed to save event: {:#}", e);
        }
        Err(_) => {
            tracing::error!(trace_id = %trace_id, ?timeout, "Timed out saving event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DEFAULT_MODEL;
    use crate::proxy::mock::{MockSender, RecordingSaver, HELLO_WORLD_SSE};
    use crate::proxy::sse::TRUNCATION_MARKER;
    use crate::proxy::types::Headers;
    use bytes::Bytes;
    use futures::stream;
    use std::io;

    const WAIT: Duration = Duration::from_secs(5);

    fn wire(sender: &Arc<MockSender>, saver: &Arc<RecordingSaver>, options: WireOptions) -> Wire {
        Wire::new(sender.clone(), saver.clone(), options)
    }

    fn chat_request() -> ProxyRequest {
        ProxyRequest::new("POST", "/v1/chat/completions")
            .with_header("Authorization", "Bearer fake-token")
            .with_header("Golens-Attribute-User-Id", "user-123")
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"model":"gpt-4","stream":true}"#)
    }

    async fn read_all(response: ProxyResponse) -> Vec<u8> {
        response
            .body
            .map(|chunk| chunk.unwrap())
            .collect::<Vec<Bytes>>()
            .await
            .concat()
    }

    #[tokio::test]
    async fn test_tap_saves_one_event_after_client_finishes() {
        let sender = Arc::new(MockSender::sse(&[HELLO_WORLD_SSE]));
        let saver = Arc::new(RecordingSaver::new());
        let options = WireOptions {
            attribute_prefix: "golens-attribute-".into(),
            ..WireOptions::default()
        };
        let wire = wire(&sender, &saver, options);

        let tapped = wire.tap("trace-123", chat_request()).await.unwrap();
        assert_eq!(tapped.response.status, 200);

        let body = read_all(tapped.response).await;
        assert_eq!(body, HELLO_WORLD_SSE.as_bytes());
        tapped.observer.wait().await;

        let events = saver.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.trace_id, "trace-123");
        assert_eq!(event.status_code, 200);
        assert_eq!(event.model, "gpt-4");
        assert_eq!(event.response, "Hello World");
        assert_eq!(event.token_count, 2);
        assert_eq!(event.attributes.len(), 1);
        assert_eq!(event.attributes["User-Id"], "user-123");
        assert_eq!(
            event.request.as_deref(),
            Some(&br#"{"model":"gpt-4","stream":true}"#[..])
        );
        assert!(event.duration_ms >= 0);
        assert!(event.end_time.unwrap() >= event.start_time);
    }

    #[tokio::test]
    async fn test_tap_forwards_cleaned_headers_and_body() {
        let sender = Arc::new(MockSender::sse(&[HELLO_WORLD_SSE]));
        let saver = Arc::new(RecordingSaver::new());
        let options = WireOptions {
            attribute_prefix: "golens-attribute-".into(),
            ..WireOptions::default()
        };
        let wire = wire(&sender, &saver, options);

        let tapped = wire.tap("trace-1", chat_request()).await.unwrap();
        read_all(tapped.response).await;

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        let forwarded = &sent[0];
        assert_eq!(forwarded.method, "POST");
        assert_eq!(forwarded.path, "/v1/chat/completions");
        assert_eq!(forwarded.headers["Authorization"], vec!["Bearer fake-token"]);
        assert_eq!(forwarded.headers["Content-Type"], vec!["application/json"]);
        assert!(!forwarded.headers.contains_key("Golens-Attribute-User-Id"));
        assert_eq!(
            forwarded.body.as_deref(),
            Some(&br#"{"model":"gpt-4","stream":true}"#[..])
        );
    }

    #[tokio::test]
    async fn test_save_survives_client_disconnect() {
        let sender = Arc::new(MockSender::sse(&[HELLO_WORLD_SSE]));
        let saver = Arc::new(RecordingSaver::new());
        let wire = wire(&sender, &saver, WireOptions::default());

        // Client reads everything, hangs up, and never looks at the handle
        let tapped = wire.tap("trace-detached", chat_request()).await.unwrap();
        read_all(tapped.response).await;
        drop(tapped.observer);

        let events = saver.wait_for(1, WAIT).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trace_id, "trace-detached");
        assert_eq!(events[0].response, "Hello World");
        assert_eq!(events[0].token_count, 2);
    }

    #[tokio::test]
    async fn test_early_client_close_saves_partial_event() {
        let first = "data: {\"model\":\"gpt-4\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n";
        let sender = Arc::new(MockSender::endless(&[first]));
        let saver = Arc::new(RecordingSaver::new());
        let wire = wire(&sender, &saver, WireOptions::default());

        let tapped = wire.tap("trace-early", chat_request()).await.unwrap();
        let mut body = tapped.response.body;
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from(first));
        // Upstream never ends, so only the client hanging up lets the observer finish
        assert!(!tapped.observer.is_finished());
        drop(body);

        tokio::time::timeout(WAIT, tapped.observer.wait()).await.unwrap();
        let events = saver.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].model, "gpt-4");
        assert_eq!(events[0].response, "Hel");
        assert_eq!(events[0].token_count, 1);
    }

    #[tokio::test]
    async fn test_client_receives_bytes_after_done() {
        let sender = Arc::new(MockSender::sse(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
            "data: [DONE]\n\n",
            ": trailing comment\n\n",
            ": more trailing\n\n",
        ]));
        let saver = Arc::new(RecordingSaver::new());
        let options = WireOptions {
            pipe_capacity: 1,
            ..WireOptions::default()
        };
        let wire = wire(&sender, &saver, options);

        let tapped = wire.tap("trace-after-done", chat_request()).await.unwrap();
        let body = read_all(tapped.response).await;
        assert!(body.ends_with(b": more trailing\n\n"));

        tapped.observer.wait().await;
        assert_eq!(saver.events()[0].response, "x");
    }

    #[tokio::test]
    async fn test_sender_failure_creates_no_event() {
        let sender = Arc::new(MockSender::failing());
        let saver = Arc::new(RecordingSaver::new());
        let wire = wire(&sender, &saver, WireOptions::default());

        let err = wire.tap("trace-fail", chat_request()).await.unwrap_err();
        assert!(matches!(err, TapError::UpstreamSend(_)));
        assert_eq!(wire.in_flight(), 0);
        assert!(saver.events().is_empty());
    }

    #[tokio::test]
    async fn test_body_read_failure_skips_upstream() {
        let sender = Arc::new(MockSender::sse(&[HELLO_WORLD_SSE]));
        let saver = Arc::new(RecordingSaver::new());
        let wire = wire(&sender, &saver, WireOptions::default());

        let broken = stream::iter(vec![
            Ok(Bytes::from("{\"mod")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client reset")),
        ])
        .boxed();
        let mut request = ProxyRequest::new("POST", "/v1/chat/completions");
        request.body = Some(RequestBody::Streaming(broken));

        let err = wire.tap("trace-broken", request).await.unwrap_err();
        assert!(matches!(err, TapError::RequestBodyRead(_)));
        assert!(sender.sent().is_empty());
        assert!(saver.events().is_empty());
    }

    #[tokio::test]
    async fn test_oversize_request_rejected() {
        let sender = Arc::new(MockSender::sse(&[HELLO_WORLD_SSE]));
        let saver = Arc::new(RecordingSaver::new());
        let options = WireOptions {
            max_request_bytes: 8,
            ..WireOptions::default()
        };
        let wire = wire(&sender, &saver, options);

        let err = wire.tap("trace-big", chat_request()).await.unwrap_err();
        assert!(matches!(err, TapError::RequestBodyRead(_)));
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_request_without_body() {
        let sender = Arc::new(MockSender::sse(&["data: [DONE]\n"]).with_status(404));
        let saver = Arc::new(RecordingSaver::new());
        let wire = wire(&sender, &saver, WireOptions::default());

        let tapped = wire
            .tap("trace-get", ProxyRequest::new("GET", "/v1/models"))
            .await
            .unwrap();
        assert_eq!(tapped.response.status, 404);
        read_all(tapped.response).await;
        tapped.observer.wait().await;

        let events = saver.events();
        assert_eq!(events[0].status_code, 404);
        assert!(events[0].request.is_none());
        assert_eq!(events[0].model, DEFAULT_MODEL);
        assert_eq!(events[0].token_count, 0);
    }

    #[tokio::test]
    async fn test_response_headers_pass_through() {
        let sender = Arc::new(MockSender::sse(&[HELLO_WORLD_SSE]));
        let saver = Arc::new(RecordingSaver::new());
        let wire = wire(&sender, &saver, WireOptions::default());

        let tapped = wire.tap("trace-h", chat_request()).await.unwrap();
        let headers: &Headers = &tapped.response.headers;
        assert_eq!(headers["x-upstream"], vec!["mock"]);
        read_all(tapped.response).await;
    }

    #[tokio::test]
    async fn test_long_response_truncated_in_event() {
        let content = "y".repeat(64);
        let line = format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        );
        let chunks: Vec<&str> = std::iter::repeat(line.as_str()).take(4).collect();
        let sender = Arc::new(MockSender::sse(&chunks));
        let saver = Arc::new(RecordingSaver::new());
        let options = WireOptions {
            max_response_bytes: 100,
            ..WireOptions::default()
        };
        let wire = wire(&sender, &saver, options);

        let tapped = wire.tap("trace-long", chat_request()).await.unwrap();
        read_all(tapped.response).await;
        tapped.observer.wait().await;

        let event = &saver.events()[0];
        assert_eq!(event.response, format!("{}{}", content, TRUNCATION_MARKER));
        assert_eq!(event.token_count, 4);
    }

    #[tokio::test]
    async fn test_failed_save_is_not_fatal() {
        let sender = Arc::new(MockSender::sse(&[HELLO_WORLD_SSE]));
        let saver = Arc::new(RecordingSaver::failing());
        let wire = wire(&sender, &saver, WireOptions::default());

        let tapped = wire.tap("trace-nosave", chat_request()).await.unwrap();
        assert_eq!(read_all(tapped.response).await, HELLO_WORLD_SSE.as_bytes());
        tapped.observer.wait().await;
        assert!(saver.events().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_save_is_bounded() {
        let sender = Arc::new(MockSender::sse(&[HELLO_WORLD_SSE]));
        let saver = Arc::new(RecordingSaver::stalled());
        let options = WireOptions {
            save_timeout: Duration::from_millis(20),
            ..WireOptions::default()
        };
        let wire = wire(&sender, &saver, options);

        let tapped = wire.tap("trace-stall", chat_request()).await.unwrap();
        read_all(tapped.response).await;

        tokio::time::timeout(WAIT, tapped.observer.wait())
            .await
            .expect("observer must finish once the save times out");
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_observers() {
        let sender = Arc::new(MockSender::sse(&[HELLO_WORLD_SSE]));
        let saver = Arc::new(RecordingSaver::new());
        let wire = wire(&sender, &saver, WireOptions::default());
        wire.start().unwrap();

        let tapped = wire.tap("trace-drain", chat_request()).await.unwrap();
        let client = tokio::spawn(read_all(tapped.response));

        wire.stop().await.unwrap();
        assert_eq!(saver.events().len(), 1);
        assert!(!wire.is_running());
        client.await.unwrap();
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.capture.max_response_bytes = 2048;
        config.capture.attribute_prefix = "x-team-".to_string();
        config.capture.save_timeout_secs = 2;
        config.stop_timeout_secs = 30;

        let sender = Arc::new(MockSender::sse(&[]));
        let saver = Arc::new(RecordingSaver::new());
        let wire = wire(&sender, &saver, WireOptions::from_config(&config));

        let options = wire.options();
        assert_eq!(options.max_response_bytes, 2048);
        assert_eq!(options.attribute_prefix, "x-team-");
        assert_eq!(options.save_timeout, Duration::from_secs(2));
        assert_eq!(options.stop_timeout, Duration::from_secs(30));
        assert_eq!(options.max_request_bytes, DEFAULT_MAX_REQUEST_BYTES);
        assert_eq!(options.pipe_capacity, DEFAULT_PIPE_CAPACITY);
    }

    #[tokio::test]
    async fn test_lifecycle_misuse_through_wire() {
        let sender = Arc::new(MockSender::sse(&[]));
        let saver = Arc::new(RecordingSaver::new());
        let wire = wire(&sender, &saver, WireOptions::default());

        assert_eq!(wire.stop().await, Err(LifecycleError::NotRunning));
        wire.start().unwrap();
        assert_eq!(wire.start(), Err(LifecycleError::AlreadyRunning));
        wire.stop().await.unwrap();
    }
}
