//! Capture and storage configuration
//!
//! - Capture: limits and knobs for what the wire records per exchange
//! - Storage: which event store receives finished events

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

use crate::proxy::headers::DEFAULT_ATTRIBUTE_PREFIX;
use crate::proxy::sse::{DEFAULT_MAX_LINE_BYTES, DEFAULT_MAX_RESPONSE_BYTES};
use crate::proxy::tee::DEFAULT_PIPE_CAPACITY;
use crate::proxy::wire::{DEFAULT_MAX_REQUEST_BYTES, DEFAULT_SAVE_TIMEOUT};

// ─────────────────────────────────────────────────────────────────────────────
// Capture Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// What the wire records and how much of it
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Response transcript cap before the truncation marker
    pub max_response_bytes: usize,
    /// Request bodies above this fail the tap
    pub max_request_bytes: usize,
    /// Longer SSE lines are dropped unparsed
    pub max_line_bytes: usize,
    /// Reserved header prefix for caller attributes
    pub attribute_prefix: String,
    /// Tee pipe depth, in chunks
    pub pipe_capacity: usize,
    /// Bound on one save call
    pub save_timeout_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            attribute_prefix: DEFAULT_ATTRIBUTE_PREFIX.to_string(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            save_timeout_secs: DEFAULT_SAVE_TIMEOUT.as_secs(),
        }
    }
}

/// Capture settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileCapture {
    pub max_response_bytes: Option<usize>,
    pub max_request_bytes: Option<usize>,
    pub max_line_bytes: Option<usize>,
    pub attribute_prefix: Option<String>,
    pub pipe_capacity: Option<usize>,
    pub save_timeout_secs: Option<u64>,
}

impl CaptureConfig {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileCapture>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        Self {
            max_response_bytes: file.max_response_bytes.unwrap_or(defaults.max_response_bytes),
            max_request_bytes: file.max_request_bytes.unwrap_or(defaults.max_request_bytes),
            max_line_bytes: file.max_line_bytes.unwrap_or(defaults.max_line_bytes),
            attribute_prefix: file
                .attribute_prefix
                .filter(|prefix| !prefix.is_empty())
                .unwrap_or(defaults.attribute_prefix),
            // A zero-depth channel can't exist
            pipe_capacity: file.pipe_capacity.unwrap_or(defaults.pipe_capacity).max(1),
            save_timeout_secs: file.save_timeout_secs.unwrap_or(defaults.save_timeout_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Event store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageBackend {
    /// Log a summary and discard (default)
    #[default]
    Noop,
    /// Append JSON Lines files
    Jsonl,
}

impl StorageBackend {
    /// Parse backend name; `None` for unknown names
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "noop" | "none" => Some(Self::Noop),
            "jsonl" => Some(Self::Jsonl),
            _ => None,
        }
    }

    /// Convert to string for TOML serialization
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Jsonl => "jsonl",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where finished events go
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for the JSONL backend
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Noop,
            dir: PathBuf::from("./events"),
        }
    }
}

/// Storage settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
pub struct FileStorage {
    pub backend: Option<String>,
    pub dir: Option<String>,
}
