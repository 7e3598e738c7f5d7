//! Header attribute splitting
//!
//! Callers tag a request with telemetry attributes by sending headers under a
//! reserved prefix (`x-proxy-attribute-<key>` by default). Those headers are
//! consumed here and never reach the upstream API.

use crate::events::Attributes;

use super::types::Headers;

/// Default reserved header prefix
pub const DEFAULT_ATTRIBUTE_PREFIX: &str = "x-proxy-attribute-";

/// Split `headers` into `(attributes, forwarded)`.
///
/// A header whose name starts with `prefix` (ASCII case-insensitive) is
/// removed from the forwarded set; its name minus the prefix, in canonical
/// header case (`user-id` -> `User-Id`), and its *first* value become one
/// attribute, whatever case the transport delivered the name in. Everything else is forwarded untouched, values
/// and their order included. Reserved headers with an empty key or no values
/// are stripped without producing an attribute.
pub fn split_attributes(headers: Headers, prefix: &str) -> (Attributes, Headers) {
    let mut attributes = Attributes::new();
    let mut forwarded = Headers::with_capacity(headers.len());

    // Sorted so the winner among case-variant duplicates is deterministic
    let mut entries: Vec<_> = headers.into_iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    for (name, values) in entries {
        let Some(key) = strip_prefix_ignore_case(&name, prefix) else {
            forwarded.entry(name).or_default().extend(values);
            continue;
        };

        if key.is_empty() {
            continue;
        }
        if let Some(first) = values.into_iter().next() {
            attributes.entry(canonical_key(key)).or_insert(first);
        }
    }

    (attributes, forwarded)
}

/// `user-id` -> `User-Id`: upper case after each `-`, lower case elsewhere
fn canonical_key(key: &str) -> String {
    let mut upper = true;
    key.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }
    // `get` returns None when the split would land inside a multi-byte char
    let head = name.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &name[prefix.len()..])
}
