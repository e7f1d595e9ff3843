//! Wire types for the quire cache HTTP surface.
//!
//! Field names follow the camelCase JSON the endpoints speak, so clients in
//! other languages can consume the same payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body accepted by the purge endpoint.
///
/// The server builds one from the raw JSON leniently (non-string tags are
/// filtered), so a client sending this shape is always accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeRequest {
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Successful purge result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResponse {
    pub success: bool,
    pub purged_query_keys: Vec<String>,
    pub purged_page_urls: Vec<String>,
    pub purged_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Error body shared by the cache endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Snapshot of both tag indexes, returned by the debug endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagIndexDebugResponse {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_index: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_index: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_tag_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url_count: Option<usize>,
}

impl TagIndexDebugResponse {
    pub fn unavailable() -> Self {
        Self::default()
    }
}

/// Result of a cached content query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub data: Value,
    pub tags: Vec<String>,
    /// One of `HIT`, `STALE`, `MISS`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
}
