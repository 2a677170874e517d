//! HTTP client for the upstream API the cache fronts.
//!
//! Supplies the `fetch` / batch-fetch functions the server hands to
//! [`CacheDomain`](crate::cache::domain::CacheDomain).

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::UpstreamConfig;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("not found: {url}")]
    NotFound { url: String },
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    ids: &'a [String],
}

/// Thin JSON client over `reqwest`.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Expand an item path template such as `/api/users/{id}`.
    pub fn item_url(&self, template: &str, id: &str) -> String {
        format!("{}{}", self.base_url, template.replace("{id}", id))
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET a single item.
    pub async fn fetch_item(&self, template: &str, id: &str) -> Result<Value, UpstreamError> {
        let url = self.item_url(template, id);
        debug!(url = %url, "Upstream fetch");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(UpstreamError::NotFound { url });
        }
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response.json::<Value>().await?)
    }

    /// POST `{"ids": [...]}` and read back an `{id: value}` object.
    ///
    /// Ids the upstream does not know are simply absent from the result.
    pub async fn fetch_batch(&self, path: &str, ids: &[String]) -> Result<HashMap<String, Value>, UpstreamError> {
        let url = self.url(path);
        debug!(url = %url, count = ids.len(), "Upstream batch fetch");

        let response = self.client.post(&url).json(&BatchRequest { ids }).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response.json::<HashMap<String, Value>>().await?)
    }
}
