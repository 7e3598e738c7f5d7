//! Config serialization to TOML
//!
//! Single source of truth for config file format.

use super::Config;

impl Config {
    /// Render the configuration as a commented TOML document
    pub fn to_toml(&self) -> String {
        let capture = &self.capture;
        let logging = &self.logging;

        format!(
            r#"# lens configuration
# Environment variables (LENS_*) override values in this file.

# Proxy bind address (LENS_BIND)
bind_addr = {bind}

# Upstream API base URL (LENS_API_URL)
api_url = {api_url}

# Whole-exchange timeout for upstream calls, seconds (LENS_UPSTREAM_TIMEOUT)
upstream_timeout_secs = {upstream_timeout}

# How long shutdown waits for in-flight saves, seconds
stop_timeout_secs = {stop_timeout}

# What gets recorded per proxied exchange
[capture]
# Response text kept per event before "... [TRUNCATED]" (LENS_MAX_RESPONSE_BYTES)
max_response_bytes = {max_response}
# Larger request bodies are rejected with 502
max_request_bytes = {max_request}
# Longer SSE lines are skipped
max_line_bytes = {max_line}
# Headers with this prefix become event attributes and are not forwarded (LENS_ATTRIBUTE_PREFIX)
attribute_prefix = {prefix}
# Chunks buffered between the client stream and the observer
pipe_capacity = {pipe_capacity}
# Bound on a single save, seconds
save_timeout_secs = {save_timeout}

# Event store (LENS_STORAGE, LENS_STORAGE_DIR)
[storage]
backend = {backend}  # noop, jsonl
dir = {storage_dir}

# Logging configuration (RUST_LOG env var overrides level)
[logging]
level = {log_level}
json = {log_json}
# File logging (in addition to stdout)
file_enabled = {log_file_enabled}
file_dir = {log_file_dir}
file_rotation = {log_file_rotation}  # hourly, daily, never
file_prefix = {log_file_prefix}
"#,
            bind = toml_string(&self.bind_addr.to_string()),
            api_url = toml_string(&self.api_url),
            upstream_timeout = self.upstream_timeout_secs,
            stop_timeout = self.stop_timeout_secs,
            max_response = capture.max_response_bytes,
            max_request = capture.max_request_bytes,
            max_line = capture.max_line_bytes,
            prefix = toml_string(&capture.attribute_prefix),
            pipe_capacity = capture.pipe_capacity,
            save_timeout = capture.save_timeout_secs,
            backend = toml_string(self.storage.backend.as_str()),
            storage_dir = toml_string(&self.storage.dir.display().to_string()),
            log_level = toml_string(&logging.level),
            log_json = logging.json,
            log_file_enabled = logging.file_enabled,
            log_file_dir = toml_string(&logging.file_dir.display().to_string()),
            log_file_rotation = toml_string(logging.file_rotation.as_str()),
            log_file_prefix = toml_string(&logging.file_prefix),
        )
    }
}

/// Quote and escape a string value for TOML
fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}
