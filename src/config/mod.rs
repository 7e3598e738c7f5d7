//! Configuration for the proxy server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/lens/config.toml)
//! 3. Built-in defaults (lowest priority)

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod capture;
mod observability;
mod serialization;


// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (maintain public API)
// ─────────────────────────────────────────────────────────────────────────────

pub use capture::{CaptureConfig, FileCapture, FileStorage, StorageBackend, StorageConfig};
pub use observability::{FileLogging, LogRotation, LoggingConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8090";
const DEFAULT_API_URL: &str = "https://api.openai.com";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Address to bind the proxy server to
    pub bind_addr: SocketAddr,

    /// Upstream API base URL
    pub api_url: String,

    /// Whole-exchange timeout for upstream calls
    pub upstream_timeout_secs: u64,

    /// Bound on draining in-flight observers at shutdown
    pub stop_timeout_secs: u64,

    /// What gets recorded per exchange
    pub capture: CaptureConfig,

    /// Where finished events go
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
            api_url: DEFAULT_API_URL.to_string(),
            upstream_timeout_secs: DEFAULT_UPSTREAM_TIMEOUT_SECS,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            capture: CaptureConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub api_url: Option<String>,
    pub upstream_timeout_secs: Option<u64>,
    pub stop_timeout_secs: Option<u64>,

    /// Optional [capture] section
    pub capture: Option<FileCapture>,

    /// Optional [storage] section
    pub storage: Option<FileStorage>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/lens/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("lens").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        // Don't overwrite existing config
        if path.exists() {
            return;
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::debug!("Could not create config directory {}: {}", parent.display(), e);
                return;
            }
        }

        // Use Config::default().to_toml() as single source of truth
        if let Err(e) = std::fs::write(&path, Self::default().to_toml()) {
            tracing::debug!("Could not write config template {}: {}", path.display(), e);
        }
    }

    /// Load configuration: env vars > file > defaults
    pub fn from_env() -> Result<Self> {
        let file = match Self::config_path() {
            Some(path) => Self::load_file_config(&path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Read and parse a config file; a missing file means all defaults
    ///
    /// A file that exists but can't be read or parsed is an error. A broken
    /// config should fail fast, not silently fall back to defaults.
    pub(crate) fn load_file_config(path: &Path) -> Result<FileConfig> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read config file {}", path.display()))
            }
        }
    }

    /// Merge a parsed file with environment lookups
    pub(crate) fn from_sources<E>(file: FileConfig, env: E) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        // Bind address: env > file > default
        let bind_raw = env("LENS_BIND")
            .or(file.bind_addr)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw
            .parse()
            .with_context(|| format!("Invalid bind address {:?}", bind_raw))?;

        // API URL: env > file > default
        let api_url = env("LENS_API_URL")
            .or(file.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        // Upstream timeout: env > file > default
        let upstream_timeout_secs = parse_env(&env, "LENS_UPSTREAM_TIMEOUT")?
            .or(file.upstream_timeout_secs)
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);

        // Stop timeout: file > default
        let stop_timeout_secs = file.stop_timeout_secs.unwrap_or(DEFAULT_STOP_TIMEOUT_SECS);

        // Capture: file section, then env overrides
        let mut capture = CaptureConfig::from_file(file.capture);
        if let Some(max) = parse_env(&env, "LENS_MAX_RESPONSE_BYTES")? {
            capture.max_response_bytes = max;
        }
        if let Some(prefix) = env("LENS_ATTRIBUTE_PREFIX").filter(|p| !p.is_empty()) {
            capture.attribute_prefix = prefix;
        }

        // Storage: env > file > default
        let file_storage = file.storage.unwrap_or_default();
        let storage_defaults = StorageConfig::default();
        let backend = match env("LENS_STORAGE").or(file_storage.backend) {
            Some(name) => StorageBackend::parse(&name).ok_or_else(|| {
                anyhow!("Unknown storage backend {:?} (expected noop or jsonl)", name)
            })?,
            None => storage_defaults.backend,
        };
        let dir = env("LENS_STORAGE_DIR")
            .or(file_storage.dir)
            .map(PathBuf::from)
            .unwrap_or(storage_defaults.dir);
        let storage = StorageConfig { backend, dir };

        let logging = LoggingConfig::from_file(file.logging);

        if api_url.trim().is_empty() {
            bail!("Upstream API URL must not be empty");
        }

        Ok(Self {
            bind_addr,
            api_url,
            upstream_timeout_secs,
            stop_timeout_secs,
            capture,
            storage,
            logging,
        })
    }
}

/// Parse an optional env var, failing with the variable name on bad input
fn parse_env<T, E>(env: &E, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    E: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| anyhow!("Invalid {}={:?}: {}", key, raw, e))
        })
        .transpose()
}
