//! Content fetchers: retrieve the article and video facets of one bookmark.

mod article;
mod layout;
mod video;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

pub use article::{ArticleFetcher, ArticleFormat};
pub use layout::{DownloadLayout, Facet};
pub use video::{VideoFetcher, VideoResolution};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Insecure reader URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
    /// External downloader missing or exited unsuccessfully
    #[error("Video tool error: {0}")]
    Tool(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Returns true if this error is transient and the request should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::HttpStatus(status) => *status >= 500 || *status == 429,
            FetchError::ResponseTooLarge(_)
            | FetchError::InvalidUrl(_)
            | FetchError::InsecureBaseUrl
            | FetchError::Tool(_)
            | FetchError::Io(_) => false,
        }
    }
}

/// Result of a successful facet fetch, not yet committed to its final path.
#[derive(Debug)]
pub enum FetchedContent {
    /// Content held in memory.
    Inline { bytes: Vec<u8>, extension: String },
    /// Content already written to a file in the staging directory.
    Staged { path: PathBuf, extension: String },
}

impl FetchedContent {
    pub fn extension(&self) -> &str {
        match self {
            FetchedContent::Inline { extension, .. } | FetchedContent::Staged { extension, .. } => {
                extension
            }
        }
    }
}

/// Retrieves content for one bookmark.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_article(&self, url: &str) -> Result<FetchedContent, FetchError>;

    async fn fetch_video(
        &self,
        url: &str,
        resolution: VideoResolution,
    ) -> Result<FetchedContent, FetchError>;
}

/// Production fetcher: HTTP for articles, yt-dlp for videos.
pub struct WebFetcher {
    article: ArticleFetcher,
    video: VideoFetcher,
}

impl WebFetcher {
    pub fn new(article: ArticleFetcher, video: VideoFetcher) -> Self {
        Self { article, video }
    }
}

#[async_trait]
impl ContentFetcher for WebFetcher {
    async fn fetch_article(&self, url: &str) -> Result<FetchedContent, FetchError> {
        self.article.fetch(url).await
    }

    async fn fetch_video(
        &self,
        url: &str,
        resolution: VideoResolution,
    ) -> Result<FetchedContent, FetchError> {
        self.video.fetch(url, resolution).await
    }
}
