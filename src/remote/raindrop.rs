use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use super::{CatalogClient, CatalogError, CatalogPage, Cursor, RemoteBookmark};
use crate::storage::ContentType;
use crate::util::{read_limited_bytes, LimitedReadError, RetryPolicy};

/// Page size requested from the API (its maximum).
const PER_PAGE: u64 = 50;
const MAX_PAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB
/// Upper bound on a server-requested `Retry-After` wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("offline-mode/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct RaindropsResponse {
    #[serde(default = "default_true")]
    result: bool,
    #[serde(default)]
    items: Vec<RaindropItem>,
    /// Total number of bookmarks in the collection
    count: Option<u64>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RaindropItem {
    #[serde(rename = "_id")]
    id: serde_json::Value,
    link: Option<String>,
    title: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RaindropItem {
    fn into_remote(self) -> Option<RemoteBookmark> {
        let id = match self.id {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) if !s.is_empty() => s,
            _ => return None,
        };
        let url = self.link.filter(|l| !l.trim().is_empty())?;
        let title = self
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string());
        let content_type = match self.kind.as_deref() {
            Some("video") => ContentType::Video,
            _ => ContentType::Article,
        };
        Some(RemoteBookmark {
            id,
            url,
            title,
            tags: self.tags,
            content_type,
        })
    }
}

/// Raindrop.io REST client listing every bookmark (collection `0` = all).
pub struct RaindropClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
    policy: RetryPolicy,
}

impl RaindropClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        token: SecretString,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            policy,
        }
    }

    fn page_url(&self, page: u64) -> Result<Url, CatalogError> {
        let mut url = Url::parse(&format!("{}/raindrops/0", self.base_url))
            .map_err(|e| CatalogError::Unavailable(format!("invalid API base URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("perpage", &PER_PAGE.to_string());
        Ok(url)
    }

    /// GET one page with timeout, retry and backoff.
    async fn fetch_page(&self, page: u64) -> Result<Vec<u8>, CatalogError> {
        let url = self.page_url(page)?;
        let mut retry_count = 0;

        loop {
            let request = self
                .http
                .get(url.clone())
                .bearer_auth(self.token.expose_secret())
                .header(reqwest::header::USER_AGENT, USER_AGENT);

            let outcome = match tokio::time::timeout(self.policy.timeout, request.send()).await {
                Err(_) => Err(CatalogError::Timeout),
                Ok(Err(e)) => Err(CatalogError::Network(e)),
                Ok(Ok(response)) => Ok(response),
            };

            let response = match outcome {
                Ok(response) => response,
                Err(e) if e.is_retryable() && self.policy.can_retry(retry_count) => {
                    let delay = self.policy.delay_for(retry_count);
                    tracing::warn!(page = page, error = %e, retry = retry_count + 1, delay_ms = delay.as_millis() as u64, "Catalog request failed, retrying");
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let status = response.status();

            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
            {
                tracing::error!(status = %status, "Catalog rejected the API token");
                return Err(CatalogError::Unauthorized);
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if !self.policy.can_retry(retry_count) {
                    return Err(CatalogError::RateLimited(retry_count));
                }
                let delay = retry_after(&response)
                    .unwrap_or_else(|| self.policy.delay_for(retry_count))
                    .min(MAX_RETRY_AFTER);
                tracing::warn!(page = page, retry = retry_count + 1, delay_ms = delay.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if status.is_server_error() {
                if !self.policy.can_retry(retry_count) {
                    return Err(CatalogError::HttpStatus(status.as_u16()));
                }
                let delay = self.policy.delay_for(retry_count);
                tracing::warn!(page = page, status = %status, retry = retry_count + 1, delay_ms = delay.as_millis() as u64, "Server error, retrying after delay");
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                return Err(CatalogError::HttpStatus(status.as_u16()));
            }

            let body =
                tokio::time::timeout(self.policy.timeout, read_limited_bytes(response, MAX_PAGE_SIZE))
                    .await;
            let Ok(body) = body else {
                if !self.policy.can_retry(retry_count) {
                    return Err(CatalogError::Timeout);
                }
                let delay = self.policy.delay_for(retry_count);
                tracing::warn!(page = page, retry = retry_count + 1, delay_ms = delay.as_millis() as u64, "Catalog page body stalled, retrying");
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            };

            match body {
                Ok(bytes) => return Ok(bytes),
                Err(LimitedReadError::Incomplete { expected, received })
                    if self.policy.can_retry(retry_count) =>
                {
                    let delay = self.policy.delay_for(retry_count);
                    tracing::debug!(page = page, expected = expected, received = received, "Retrying incomplete catalog page");
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(LimitedReadError::Network(e)) => return Err(CatalogError::Network(e)),
                Err(e) => return Err(CatalogError::Unavailable(e.to_string())),
            }
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl CatalogClient for RaindropClient {
    async fn list_bookmarks(&self, cursor: Option<Cursor>) -> Result<CatalogPage, CatalogError> {
        let page = cursor.map(|c| c.0).unwrap_or(0);
        tracing::debug!(page = page, "Fetching bookmarks page");

        let body = self.fetch_page(page).await?;
        let response: RaindropsResponse =
            serde_json::from_slice(&body).map_err(|e| CatalogError::Decode(e.to_string()))?;

        if !response.result {
            return Err(CatalogError::Unavailable(
                response
                    .error_message
                    .unwrap_or_else(|| "API returned result=false".to_string()),
            ));
        }

        let raw_len = response.items.len() as u64;
        let mut items = Vec::with_capacity(response.items.len());
        for raw in response.items {
            match raw.into_remote() {
                Some(item) => items.push(item),
                None => tracing::warn!(page = page, "Bookmark without id or link, skipping"),
            }
        }

        let is_last = raw_len < PER_PAGE;
        if is_last {
            if let Some(expected) = response.count {
                let received = page * PER_PAGE + raw_len;
                if received < expected {
                    return Err(CatalogError::Truncated { expected, received });
                }
            }
        }

        Ok(CatalogPage {
            items,
            next: (!is_last).then_some(Cursor(page + 1)),
        })
    }
}
