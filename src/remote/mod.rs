//! Remote bookmark catalog.
//!
//! The engine only depends on the [`CatalogClient`] trait: a paginated
//! `list_bookmarks(cursor)` call. [`catalog_stream`] turns any client into a
//! lazy stream of descriptors, and [`RaindropClient`] is the production
//! implementation for the Raindrop.io REST API.

mod raindrop;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

use crate::storage::ContentType;

pub use raindrop::RaindropClient;

/// A bookmark as described by the remote catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteBookmark {
    pub id: String,
    pub url: String,
    pub title: String,
    pub tags: Vec<String>,
    pub content_type: ContentType,
}

/// Opaque position in the paginated listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(pub u64);

/// One page of the listing. `next == None` means the listing is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogPage {
    pub items: Vec<RemoteBookmark>,
    pub next: Option<Cursor>,
}

/// Why the remote catalog could not be listed.
///
/// Every variant means the same thing to the engine: the listing is not
/// known to be complete, so removal detection is off for this cycle.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
    #[error("Authentication failed: check the API token")]
    Unauthorized,
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Malformed catalog response: {0}")]
    Decode(String),
    /// The API reported more bookmarks than the pages delivered
    #[error("Truncated listing: expected {expected} bookmarks, received {received}")]
    Truncated { expected: u64, received: u64 },
}

impl CatalogError {
    /// Returns true if this error is transient and the request should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            CatalogError::Timeout | CatalogError::Network(_) => true,
            CatalogError::HttpStatus(status) => *status >= 500,
            CatalogError::Unavailable(_)
            | CatalogError::Unauthorized
            | CatalogError::RateLimited(_)
            | CatalogError::Decode(_)
            | CatalogError::Truncated { .. } => false,
        }
    }
}

/// Source of the remote bookmark listing.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch the page at `cursor` (`None` = first page).
    async fn list_bookmarks(&self, cursor: Option<Cursor>) -> Result<CatalogPage, CatalogError>;
}

/// Lazily walk every page of `client`, yielding descriptors in listing order.
///
/// Pages are requested only as the stream is polled. A failed page yields a
/// single `Err` item and ends the stream.
pub fn catalog_stream(
    client: &dyn CatalogClient,
) -> BoxStream<'_, Result<RemoteBookmark, CatalogError>> {
    // Outer None: listing finished. Some(cursor): next page to request.
    stream::unfold(Some(None), move |state: Option<Option<Cursor>>| async move {
        let cursor = state?;
        match client.list_bookmarks(cursor).await {
            Ok(page) => Some((Ok(page.items), page.next.map(Some))),
            Err(e) => Some((Err(e), None)),
        }
    })
    .flat_map(|page| match page {
        Ok(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
        Err(e) => stream::once(async move { Err(e) }).boxed(),
    })
    .boxed()
}
