//! `GET /api/query`: cached content queries for page renderers.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Query, State},
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use quire_api_types::QueryResponse;
use serde_json::Value;

use crate::application::error::AppError;
use crate::cache::{CacheMode, QueryCacheOptions, QueryParams, RequestScope};

use super::HttpState;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Parsed query-string of the query route.
///
/// `$name=<json>` entries become query params; a value that is not valid
/// JSON is passed as a string.
#[derive(Debug)]
struct QueryRequest {
    query: String,
    params: QueryParams,
    cache: CacheMode<QueryCacheOptions>,
    page_cache: bool,
}

fn parse_request(
    pairs: Vec<(String, String)>,
    defaults: &QueryCacheOptions,
) -> Result<QueryRequest, AppError> {
    let mut query = None;
    let mut params = QueryParams::new();
    let mut enabled = true;
    let mut page_cache = true;
    let mut options = defaults.clone();
    let mut overridden = false;

    for (name, value) in pairs {
        if let Some(param) = name.strip_prefix('$') {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            params.insert(param.to_string(), value);
            continue;
        }
        match name.as_str() {
            "query" => query = Some(value),
            "cache" => enabled = parse_flag(&name, &value)?,
            "pageCache" => page_cache = parse_flag(&name, &value)?,
            "maxAge" => {
                options.max_age = parse_seconds(&name, &value)?;
                overridden = true;
            }
            "staleWhileRevalidate" => {
                options.stale_while_revalidate = parse_seconds(&name, &value)?;
                overridden = true;
            }
            "keyPrefix" => {
                options.key_prefix = value;
                overridden = true;
            }
            _ => {}
        }
    }

    let query = query
        .filter(|query| !query.trim().is_empty())
        .ok_or_else(|| AppError::validation("`query` is required"))?;
    let cache = match (enabled, overridden) {
        (false, _) => CacheMode::Toggle(false),
        (true, true) => CacheMode::Options(options),
        (true, false) => CacheMode::Toggle(true),
    };

    Ok(QueryRequest {
        query,
        params,
        cache,
        page_cache,
    })
}

fn parse_flag(name: &str, value: &str) -> Result<bool, AppError> {
    value
        .parse()
        .map_err(|_| AppError::validation(format!("`{name}` must be true or false")))
}

fn parse_seconds(name: &str, value: &str) -> Result<u64, AppError> {
    value
        .parse()
        .map_err(|_| AppError::validation(format!("`{name}` must be a whole number of seconds")))
}

pub(super) async fn run_query(
    State(state): State<HttpState>,
    scope: Option<Extension<Arc<RequestScope>>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, AppError> {
    let request = parse_request(pairs, &state.page.config.query)?;
    let scope = scope.map(|Extension(scope)| scope);
    if let Some(scope) = scope.as_deref()
        && !request.page_cache
    {
        scope.set_page_mode(CacheMode::Toggle(false));
    }

    let result = state
        .loader
        .load_query(&request.query, &request.params, &request.cache, scope.as_deref())
        .await?;

    let status = HeaderValue::from_static(result.status.as_str());
    let body = QueryResponse {
        data: result.data,
        tags: result.tags,
        status: result.status.to_string(),
        age: result.age,
    };
    Ok(([(X_CACHE, status)], Json(body)).into_response())
}
