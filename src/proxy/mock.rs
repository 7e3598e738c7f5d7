// Test doubles for the sender and saver capabilities

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use tokio::sync::Notify;

use super::sender::Sender;
use super::types::{BodyStream, Headers, ProxyRequest, ProxyResponse};
use crate::events::Event;
use crate::storage::Saver;

/// SSE body used across the proxy tests
pub(crate) const HELLO_WORLD_SSE: &str = "data: {\"model\":\"gpt-4\",\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
                                          data: {\"choices\":[{\"delta\":{\"content\":\" World\"}}]}\n\n\
                                          data: [DONE]";

/// What the sender was asked to forward
#[derive(Debug, Clone)]
pub(crate) struct SentRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

enum Reply {
    Chunks { status: u16, chunks: Vec<Bytes>, endless: bool },
    Fail,
}

/// Canned upstream that records every request it receives
pub(crate) struct MockSender {
    reply: Reply,
    sent: Mutex<Vec<SentRequest>>,
}

impl MockSender {
    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// 200 text/event-stream, one chunk per element of `chunks`
    pub fn sse(chunks: &[&str]) -> Self {
        Self::with_reply(Reply::Chunks {
            status: 200,
            chunks: chunks.iter().map(|c| Bytes::copy_from_slice(c.as_bytes())).collect(),
            endless: false,
        })
    }

    /// Like `sse`, but the body never ends after the given chunks
    pub fn endless(chunks: &[&str]) -> Self {
        Self::with_reply(Reply::Chunks {
            status: 200,
            chunks: chunks.iter().map(|c| Bytes::copy_from_slice(c.as_bytes())).collect(),
            endless: true,
        })
    }

    pub fn with_status(mut self, code: u16) -> Self {
        if let Reply::Chunks { status, .. } = &mut self.reply {
            *status = code;
        }
        self
    }

    /// Every send fails as if the upstream were unreachable
    pub fn failing() -> Self {
        Self::with_reply(Reply::Fail)
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sender for MockSender {
    async fn send(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let (status, chunks, endless) = match &self.reply {
            Reply::Fail => bail!("connection refused"),
            Reply::Chunks {
                status,
                chunks,
                endless,
            } => (*status, chunks.clone(), *endless),
        };

        let body = match request.body {
            Some(body) => Some(body.into_bytes(usize::MAX).await?),
            None => None,
        };
        self.sent.lock().unwrap().push(SentRequest {
            method: request.method,
            path: request.path,
            headers: request.headers,
            body,
        });

        let mut headers = Headers::new();
        headers.insert("content-type".into(), vec!["text/event-stream".into()]);
        headers.insert("x-upstream".into(), vec!["mock".into()]);

        let chunks = stream::iter(chunks.into_iter().map(Ok));
        let body: BodyStream = if endless {
            chunks.chain(stream::pending()).boxed()
        } else {
            chunks.boxed()
        };

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

/// Saver that keeps every event in memory
pub(crate) struct RecordingSaver {
    events: Mutex<Vec<Event>>,
    saved: Notify,
    behavior: SaveBehavior,
}

#[derive(Clone, Copy)]
enum SaveBehavior {
    Record,
    Fail,
    Stall,
}

impl RecordingSaver {
    fn with_behavior(behavior: SaveBehavior) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            saved: Notify::new(),
            behavior,
        }
    }

    pub fn new() -> Self {
        Self::with_behavior(SaveBehavior::Record)
    }

    /// Every save returns an error
    pub fn failing() -> Self {
        Self::with_behavior(SaveBehavior::Fail)
    }

    /// Every save hangs forever
    pub fn stalled() -> Self {
        Self::with_behavior(SaveBehavior::Stall)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until at least `count` events were saved, or panic after `limit`
    pub async fn wait_for(&self, count: usize, limit: Duration) -> Vec<Event> {
        let wait = async {
            loop {
                let notified = self.saved.notified();
                let events = self.events();
                if events.len() >= count {
                    return events;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .expect("timed out waiting for saved events")
    }
}

#[async_trait]
impl Saver for RecordingSaver {
    async fn save(&self, event: Event) -> Result<()> {
        match self.behavior {
            SaveBehavior::Record => {
                self.events.lock().unwrap().push(event);
                self.saved.notify_waiters();
                Ok(())
            }
            SaveBehavior::Fail => bail!("store unavailable"),
            SaveBehavior::Stall => std::future::pending().await,
        }
    }
}
