// JSON Lines event store
//
// One JSON object per line, one file per process run, so stored events can be
// grepped or piped through jq:
//
//   jq 'select(.model == "gpt-4") | .token_count' events/events-20251127-143022-a7b3.jsonl

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::Saver;
use crate::events::Event;

/// Appends events to `<dir>/events-<session>.jsonl`
pub struct JsonlSaver {
    file: Arc<EventFile>,
}

/// The session file plus the lock that keeps appends whole
struct EventFile {
    path: PathBuf,
    /// Serializes appends so concurrent saves never interleave lines
    write_lock: Mutex<()>,
}

impl JsonlSaver {
    /// Create the directory if needed and pick this session's file
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create event directory {}", dir.display()))?;

        let path = dir.join(format!("events-{}.jsonl", session_id()));
        tracing::info!("Event store: {}", path.display());

        Ok(Self {
            file: Arc::new(EventFile {
                path,
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }
}

impl EventFile {
    async fn append(&self, line: Vec<u8>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        file.write_all(&line).await.context("Failed to write event")?;
        // Flush so events survive a crash right after the save
        file.flush().await.context("Failed to flush event file")?;

        Ok(())
    }
}

#[async_trait]
impl Saver for JsonlSaver {
    async fn save(&self, mut event: Event) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        event.id = Some(id);

        let mut line = serde_json::to_vec(&event).context("Failed to serialize event")?;
        line.push(b'\n');

        // The append runs on its own task: a caller that gives up (timeout,
        // cancellation) must not leave half a line behind.
        let file = self.file.clone();
        tokio::spawn(async move { file.append(line).await })
            .await
            .context("Event write task failed")?
    }
}

/// Session id for file naming: YYYYMMDD-HHMMSS-XXXX
fn session_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", timestamp, &random[..4])
}
