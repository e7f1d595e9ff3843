//! HTTP surface: purge and debug endpoints, the query route and health.

mod cache;
mod middleware;
mod query;

pub use middleware::RequestContext;

use axum::{
    Router,
    http::StatusCode,
    middleware as axum_middleware,
    routing::{any, get},
};

use crate::{
    application::content::ContentLoader,
    cache::{PageCacheState, PurgeCoordinator, page_cache_layer},
};

use middleware::{log_responses, set_request_context};

pub const PURGE_PATH: &str = "/api/cache/purge";
pub const DEBUG_PATH: &str = "/api/cache/debug";
pub const QUERY_PATH: &str = "/api/query";
pub const HEALTH_PATH: &str = "/_health";

#[derive(Clone)]
pub struct HttpState {
    pub loader: ContentLoader,
    /// Absent when no cache store is available.
    pub purge: Option<PurgeCoordinator>,
    pub page: PageCacheState,
}

pub fn build_router(state: HttpState) -> Router {
    let page_state = state.page.clone();

    Router::new()
        .route(PURGE_PATH, any(cache::purge))
        .route(DEBUG_PATH, get(cache::debug))
        .route(QUERY_PATH, get(query::run_query))
        .route(HEALTH_PATH, get(health))
        .layer(axum_middleware::from_fn_with_state(
            page_state,
            page_cache_layer,
        ))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
