// Storage module - where finished telemetry events go
//
// The proxy hands every completed `Event` to a `Saver` exactly once, from a
// background task, under its own timeout. Backends:
//
// - `noop`: logs a one-line summary and discards the event
// - `jsonl`: appends one JSON object per line to a per-session file

pub mod jsonl;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{StorageBackend, StorageConfig};
use crate::events::Event;

pub use jsonl::JsonlSaver;

/// Durable sink for completed events
///
/// Called once per event. The proxy never retries, so implementations that
/// want retries add their own.
#[async_trait]
pub trait Saver: Send + Sync {
    async fn save(&self, event: Event) -> Result<()>;
}

/// Characters of response text shown in the noop summary
const PREVIEW_CHARS: usize = 50;

/// Saver that only logs what it would have stored
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSaver;

#[async_trait]
impl Saver for NoopSaver {
    async fn save(&self, event: Event) -> Result<()> {
        tracing::info!(
            trace_id = %event.trace_id,
            model = %event.model,
            tokens = event.token_count,
            status = event.status_code,
            duration_ms = event.duration_ms,
            attributes = ?event.attributes,
            "Event captured: {}",
            preview(&event.response, PREVIEW_CHARS)
        );
        Ok(())
    }
}

/// First `max_chars` characters of `text`, with an ellipsis when cut
fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Build the saver selected in config
pub fn build_saver(config: &StorageConfig) -> Result<Arc<dyn Saver>> {
    let saver: Arc<dyn Saver> = match config.backend {
        StorageBackend::Noop => Arc::new(NoopSaver),
        StorageBackend::Jsonl => Arc::new(JsonlSaver::new(&config.dir)?),
    };
    tracing::debug!(backend = %config.backend, "Event storage ready");
    Ok(saver)
}
