// Telemetry events produced by the proxy
//
// One `Event` is created per proxied exchange. The tap fills in the request
// side, the SSE observer fills in model/tokens/response while the body
// streams, and the background task finalizes timing before handing the event
// to a `Saver` exactly once.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Model name used until the stream reports one
pub const DEFAULT_MODEL: &str = "unknown";

/// Caller-supplied attributes extracted from reserved headers
pub type Attributes = BTreeMap<String, String>;

/// Telemetry record for one proxied exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the store; absent until saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub trace_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub status_code: u16,
    /// Approximate: one per content-bearing delta, not a real tokenizer count
    pub token_count: u32,
    pub model: String,
    /// Raw request body as captured before forwarding
    #[serde(default, with = "request_body", skip_serializing_if = "Option::is_none")]
    pub request: Option<Bytes>,
    /// Accumulated response text, capped and possibly suffixed with a marker
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Event {
    /// Start a new event at the current instant
    pub fn new(trace_id: impl Into<String>, request: Option<Bytes>, attributes: Attributes) -> Self {
        Self {
            id: None,
            trace_id: trace_id.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: 0,
            status_code: 0,
            token_count: 0,
            model: DEFAULT_MODEL.to_string(),
            request,
            response: String::new(),
            attributes,
        }
    }

    /// Record the model name unless an earlier chunk already did (first write wins)
    pub fn capture_model(&mut self, model: &str) {
        if !model.is_empty() && self.model == DEFAULT_MODEL {
            self.model = model.to_string();
        }
    }

    /// Close the event at `end`, deriving a non-negative duration
    pub fn finish(&mut self, end: DateTime<Utc>) {
        self.end_time = Some(end);
        self.duration_ms = (end - self.start_time).num_milliseconds().max(0);
    }
}

/// Serde adapter for the captured request body.
///
/// Single-line JSON bodies are embedded verbatim (key order and number text
/// untouched) so stored events stay queryable with jq. Anything else,
/// including multi-line JSON that would break a JSON Lines record, is stored
/// as a (lossy) UTF-8 string.
mod request_body {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::value::RawValue;

    pub fn serialize<S: Serializer>(body: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        let Some(bytes) = body else {
            return serializer.serialize_none();
        };
        match embeddable(bytes) {
            Some(raw) => raw.serialize(serializer),
            None => String::from_utf8_lossy(bytes).serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        let raw = Option::<Box<RawValue>>::deserialize(deserializer)?;
        raw.map(|raw| {
            let text = raw.get();
            if text.starts_with('"') {
                serde_json::from_str::<String>(text)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            } else {
                Ok(Bytes::copy_from_slice(text.as_bytes()))
            }
        })
        .transpose()
    }

    /// The body as a raw JSON value, if it can sit inside one JSON line
    fn embeddable(bytes: &[u8]) -> Option<Box<RawValue>> {
        let text = std::str::from_utf8(bytes).ok()?;
        if text.contains(['\n', '\r']) || text.trim() != text || text.starts_with('"') {
            return None;
        }
        RawValue::from_string(text.to_string()).ok()
    }
}
