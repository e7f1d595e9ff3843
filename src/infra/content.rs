//! HTTP content source backed by the hosted query API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::application::content::{ContentError, ContentSource};
use crate::cache::{Fetched, QueryParams};
use crate::config::ContentSettings;

use super::error::InfraError;

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryEnvelope {
    result: Value,
    #[serde(default)]
    sync_tags: Vec<String>,
}

/// Queries `{api}/v{version}/data/query/{dataset}`.
#[derive(Clone)]
pub struct HttpContentSource {
    client: Client,
    query_url: Url,
}

impl HttpContentSource {
    pub fn new(settings: &ContentSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| InfraError::content_client(err.to_string()))?;
        let version = format!("v{}", settings.api_version);
        let query_url = endpoint(
            &settings.api_url,
            &[version.as_str(), "data", "query", settings.dataset.as_str()],
        )?;
        Ok(Self { client, query_url })
    }

    /// Request URL for `query`; params go out as `$name=<json>`.
    pub fn request_url(&self, query: &str, params: &QueryParams) -> Url {
        let mut url = self.query_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("query", query);
            for (name, value) in params {
                pairs.append_pair(&format!("${name}"), &value.to_string());
            }
        }
        url
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    #[instrument(skip_all, fields(query_len = query.len(), param_count = params.len()))]
    async fn fetch(
        &self,
        query: &str,
        params: &QueryParams,
    ) -> Result<Fetched<Value>, ContentError> {
        let response = self
            .client
            .get(self.request_url(query, params))
            .send()
            .await
            .map_err(|err| ContentError::transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ContentError::Upstream {
                status: status.as_u16(),
                message: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let envelope: QueryEnvelope = response
            .json()
            .await
            .map_err(|err| ContentError::decode(err.to_string()))?;
        debug!(tag_count = envelope.sync_tags.len(), "Content query answered");

        Ok(Fetched {
            data: envelope.result,
            tags: envelope.sync_tags,
        })
    }
}

pub(crate) fn user_agent() -> &'static str {
    concat!("quire/", env!("CARGO_PKG_VERSION"))
}

/// Append `segments` to the path of `base`.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, InfraError> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| InfraError::configuration(format!("`{base}` cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn settings(api_url: &str) -> ContentSettings {
        ContentSettings {
            api_url: Url::parse(api_url).expect("url"),
            dataset: "production".to_string(),
            api_version: "2025-02-19".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn endpoint_appends_segments() {
        let base = Url::parse("https://abc.api.example.com/").expect("url");
        let url = endpoint(&base, &["v1", "data", "query", "prod"]).expect("endpoint");
        assert_eq!(url.as_str(), "https://abc.api.example.com/v1/data/query/prod");

        let nested = Url::parse("https://example.com/proxy?x=1").expect("url");
        let url = endpoint(&nested, &["v1"]).expect("endpoint");
        assert_eq!(url.as_str(), "https://example.com/proxy/v1");
    }

    #[test]
    fn request_url_encodes_query_and_params() {
        let source =
            HttpContentSource::new(&settings("https://abc.api.example.com")).expect("source");
        let mut params = QueryParams::new();
        params.insert("slug".to_string(), json!("hello world"));

        let url = source.request_url("*[slug == $slug]", &params);
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert_eq!(url.path(), "/v2025-02-19/data/query/production");
        assert_eq!(
            pairs,
            vec![
                ("query".to_string(), "*[slug == $slug]".to_string()),
                ("$slug".to_string(), "\"hello world\"".to_string()),
            ]
        );
    }

    #[test]
    fn envelope_defaults_missing_tags() {
        let envelope: QueryEnvelope =
            serde_json::from_value(json!({ "result": [1, 2], "ms": 3 })).expect("decode");
        assert_eq!(envelope.result, json!([1, 2]));
        assert!(envelope.sync_tags.is_empty());
    }
}
