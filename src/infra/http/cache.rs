//! Purge and debug endpoints.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderValue, Method, StatusCode, header::ALLOW},
    response::{IntoResponse, Response},
};
use quire_api_types::{PurgeRequest, PurgeResponse, TagIndexDebugResponse};
use serde_json::Value;
use tracing::info;

use crate::application::error::HttpError;
use crate::cache::{PurgeReport, distinct_key_count};

use super::HttpState;

const SOURCE: &str = "infra::http::cache::purge";

/// Lenient purge body parsing: non-string and empty tags are dropped.
fn parse_purge_body(body: &[u8]) -> Result<PurgeRequest, HttpError> {
    let value: Value = serde_json::from_slice(body).map_err(|err| {
        HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, "Invalid JSON body", &err)
    })?;

    let tags = value
        .get("tags")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            HttpError::new(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Missing or invalid tags array",
                "`tags` must be an array",
            )
        })?
        .iter()
        .filter_map(Value::as_str)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect();

    let event_id = value
        .get("eventId")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(PurgeRequest { tags, event_id })
}

fn purge_response(report: PurgeReport, event_id: Option<String>) -> PurgeResponse {
    PurgeResponse {
        success: true,
        purged_query_keys: report.purged_query_keys,
        purged_page_urls: report.purged_page_urls,
        purged_tags: report.purged_tags,
        event_id,
    }
}

pub(super) async fn purge(State(state): State<HttpState>, method: Method, body: Bytes) -> Response {
    if method != Method::POST {
        let mut response = HttpError::new(
            SOURCE,
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
            format!("{method} is not supported"),
        )
        .into_response();
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("POST"));
        return response;
    }

    let body = match parse_purge_body(&body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };

    let Some(coordinator) = state.purge.clone() else {
        info!(
            event_id = body.event_id.as_deref().unwrap_or(""),
            "Purge requested without a cache store"
        );
        return Json(purge_response(PurgeReport::default(), body.event_id)).into_response();
    };

    let tags = body.tags;
    match tokio::spawn(async move { coordinator.purge_by_tags(&tags).await }).await {
        Ok(report) => {
            info!(
                event_id = body.event_id.as_deref().unwrap_or(""),
                purged_tags = report.purged_tags.len(),
                "Purge request handled"
            );
            Json(purge_response(report, body.event_id)).into_response()
        }
        Err(err) => HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Purge failed",
            &err,
        )
        .into_response(),
    }
}

pub(super) async fn debug(State(state): State<HttpState>) -> Json<TagIndexDebugResponse> {
    let Some(coordinator) = state.purge.as_ref() else {
        return Json(TagIndexDebugResponse::unavailable());
    };

    let tag_index = coordinator.query_index().get().await;
    let page_index = coordinator.page_index().get().await;

    Json(TagIndexDebugResponse {
        available: true,
        tag_count: Some(tag_index.len()),
        key_count: Some(distinct_key_count(&tag_index)),
        tag_index: Some(tag_index),
        page_tag_count: Some(page_index.len()),
        page_url_count: Some(distinct_key_count(&page_index)),
        page_index: Some(page_index),
    })
}
