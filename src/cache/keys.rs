//! Cache key construction.
//!
//! Query keys place the query text and canonical JSON params into fixed
//! query-string positions under a synthetic authority; page keys are the
//! absolute request URL.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::form_urlencoded;

const QUERY_KEY_BASE: &str = "https://query-cache.internal";
const RESERVED_KEY_PREFIX: &str = "https://query-cache.internal/__";

/// Parameters bound into a content query.
pub type QueryParams = Map<String, Value>;

/// Opaque, deterministic cache lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Internal bookkeeping key (tag indexes) rather than a cached result.
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with(RESERVED_KEY_PREFIX) && !self.0.contains('?')
    }

    pub(crate) fn reserved(name: &str) -> Self {
        Self(format!("{RESERVED_KEY_PREFIX}{name}"))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Build the cache key for a query result.
///
/// Params are serialized with object keys sorted at every depth, so insertion
/// order never changes the key.
pub fn query_key(query: &str, params: &QueryParams, prefix: &str) -> CacheKey {
    let mut canonical = String::new();
    write_canonical_object(params, &mut canonical);

    let prefix: String = form_urlencoded::byte_serialize(prefix.as_bytes()).collect();
    let encoded = form_urlencoded::Serializer::new(String::new())
        .append_pair("query", query)
        .append_pair("params", &canonical)
        .finish();

    CacheKey(format!("{QUERY_KEY_BASE}/{prefix}?{encoded}"))
}

/// Build the cache key for a full page: the absolute request URL.
pub fn page_key(url: &str) -> CacheKey {
    CacheKey(url.to_string())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_canonical_object(map: &Map<String, Value>, out: &mut String) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    out.push('{');
    for (index, (key, value)) in entries.into_iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(value, out);
    }
    out.push('}');
}
