use chrono::Utc;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use super::{FetchError, FetchedContent};
use crate::util::{read_limited_bytes, validate_url, HostPolicy, LimitedReadError, RetryPolicy};

const MAX_CONTENT_SIZE: usize = 10 * 1024 * 1024; // 10MB
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

/// CSS selectors targeting main article content across common blog platforms.
/// Order matters: more specific selectors first, generic fallbacks last.
const TARGET_SELECTORS: &str =
    "article, .entry-content, .post-content, .article-content, .post-body, main .content, main";

/// Below this many bytes the selector is assumed to have missed the content.
const MIN_CONTENT_LEN: usize = 200;

/// How an article is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleFormat {
    /// Raw page HTML, marked as an offline copy.
    #[default]
    Html,
    /// Readable text extracted by the reader proxy.
    Markdown,
}

impl ArticleFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArticleFormat::Html => "html",
            ArticleFormat::Markdown => "md",
        }
    }
}

impl fmt::Display for ArticleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArticleFormat::Html => "html",
            ArticleFormat::Markdown => "markdown",
        })
    }
}

impl FromStr for ArticleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "html" => Ok(ArticleFormat::Html),
            "markdown" | "md" => Ok(ArticleFormat::Markdown),
            other => Err(format!("unknown article format '{other}'")),
        }
    }
}

/// Fetches the article facet of a bookmark.
pub struct ArticleFetcher {
    client: reqwest::Client,
    format: ArticleFormat,
    reader_base_url: String,
    policy: RetryPolicy,
}

impl ArticleFetcher {
    pub fn new(
        client: reqwest::Client,
        format: ArticleFormat,
        reader_base_url: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            format,
            reader_base_url: reader_base_url.into().trim_end_matches('/').to_string(),
            policy,
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        let bytes = match self.format {
            ArticleFormat::Html => self.fetch_html(url).await?,
            ArticleFormat::Markdown => self.fetch_readable(url).await?,
        };
        Ok(FetchedContent::Inline {
            bytes,
            extension: self.format.extension().to_string(),
        })
    }

    async fn fetch_html(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        // Bookmarks may legitimately point at intranet hosts; only the scheme is checked
        let parsed =
            validate_url(url, HostPolicy::Any).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        let body = self.get_with_retry(parsed.as_str(), false).await?;
        let html = String::from_utf8_lossy(&body);
        Ok(prepare_offline_html(&html).into_bytes())
    }

    async fn fetch_readable(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        // The reader proxy fetches on our behalf, so internal hosts are refused
        let parsed = validate_url(url, HostPolicy::PublicOnly)
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        let base = self.reader_base_url.as_str();
        if !base.starts_with("https://") {
            let is_localhost =
                base.starts_with("http://127.0.0.1") || base.starts_with("http://localhost");
            if !is_localhost {
                tracing::error!(base_url = %base, "Rejecting non-HTTPS reader URL");
                return Err(FetchError::InsecureBaseUrl);
            }
            tracing::warn!(base_url = %base, "Using non-HTTPS reader URL (localhost only)");
        }

        let reader_url = format!("{}/{}", base, parsed.as_str());

        // First attempt: with X-Target-Selector for cleaner extraction
        let body = self.get_with_retry(&reader_url, true).await?;
        let text = String::from_utf8_lossy(&body);
        if text.len() >= MIN_CONTENT_LEN {
            return Ok(strip_boilerplate(&text).into_bytes());
        }

        tracing::debug!(
            content_len = text.len(),
            "Target selector returned minimal content, retrying without selector"
        );
        let body = self.get_with_retry(&reader_url, false).await?;
        Ok(strip_boilerplate(&String::from_utf8_lossy(&body)).into_bytes())
    }

    /// GET with per-attempt timeout and exponential backoff on transient errors.
    async fn get_with_retry(&self, url: &str, use_selector: bool) -> Result<Vec<u8>, FetchError> {
        let mut retry_count = 0;

        loop {
            match self.get_once(url, use_selector).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && self.policy.can_retry(retry_count) => {
                    let delay = self.policy.delay_for(retry_count);
                    tracing::debug!(
                        error = %e,
                        retry = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying article fetch after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, url: &str, use_selector: bool) -> Result<Vec<u8>, FetchError> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT);
        if use_selector {
            request = request.header("X-Target-Selector", TARGET_SELECTORS);
        }

        // The timeout covers the body as well as the headers
        tokio::time::timeout(self.policy.timeout, async {
            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }

            read_limited_bytes(response, MAX_CONTENT_SIZE)
                .await
                .map_err(|e| match e {
                    LimitedReadError::Network(e) => FetchError::Network(e),
                    LimitedReadError::TooLarge(limit) => FetchError::ResponseTooLarge(limit),
                    // A short body is a dropped connection in disguise
                    LimitedReadError::Incomplete { .. } => FetchError::Timeout,
                })
        })
        .await
        .map_err(|_| FetchError::Timeout)?
    }
}

/// Mark a saved page as an offline copy and disable meta refresh redirects.
///
/// The `offline-copy` meta tag goes first inside `<head>`; pages without a
/// head element are left without it.
pub(crate) fn prepare_offline_html(html: &str) -> String {
    let cleaned = remove_meta_refresh(html);

    let Some(head_end) = find_head_open_end(&cleaned) else {
        return cleaned;
    };

    let marker = format!(
        r#"<meta name="offline-copy" content="Saved on {}">"#,
        Utc::now().format("%Y-%m-%d %H:%M:%S")
    );
    let mut out = String::with_capacity(cleaned.len() + marker.len());
    out.push_str(&cleaned[..head_end]);
    out.push_str(&marker);
    out.push_str(&cleaned[head_end..]);
    out
}

/// Byte offset just past the opening `<head ...>` tag, if any.
fn find_head_open_end(html: &str) -> Option<usize> {
    // ASCII lowercasing keeps byte offsets aligned with the original
    let lower = html.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find("<head") {
        let start = from + pos;
        let after = lower.as_bytes().get(start + 5).copied();
        // Skip <header>
        if matches!(after, Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            return lower[start..].find('>').map(|end| start + end + 1);
        }
        from = start + 5;
    }
    None
}

fn remove_meta_refresh(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while let Some(pos) = lower[cursor..].find("<meta") {
        let start = cursor + pos;
        let Some(len) = lower[start..].find('>') else {
            break;
        };
        let end = start + len + 1;
        let tag: String = lower[start..end].chars().filter(|c| *c != '"' && *c != '\'').collect();

        out.push_str(&html[cursor..start]);
        if !tag.contains("http-equiv=refresh") {
            out.push_str(&html[start..end]);
        }
        cursor = end;
    }

    out.push_str(&html[cursor..]);
    out
}

/// Strip navigation and comment scaffolding the reader proxy leaves behind.
fn strip_boilerplate(content: &str) -> String {
    content
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !(trimmed.starts_with("[Skip to content]")
                || trimmed == "Loading Comments..."
                || trimmed == "Write a Comment..."
                || trimmed.starts_with("Email (Required)")
                || trimmed.contains("Proudly powered by WordPress")
                || trimmed == "Menu")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header_exists, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        }
    }

    fn fetcher(format: ArticleFormat, reader: &str) -> ArticleFetcher {
        ArticleFetcher::new(reqwest::Client::new(), format, reader, fast_policy())
    }

    fn inline_text(content: FetchedContent) -> (String, String) {
        match content {
            FetchedContent::Inline { bytes, extension } => {
                (String::from_utf8(bytes).unwrap(), extension)
            }
            other => panic!("expected inline content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_html_page_saved_with_marker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><head><title>T</title></head><body>Hello</body></html>",
            ))
            .mount(&server)
            .await;

        let result = fetcher(ArticleFormat::Html, "https://r.jina.ai")
            .fetch(&format!("{}/post", server.uri()))
            .await
            .unwrap();
        let (text, ext) = inline_text(result);
        assert_eq!(ext, "html");
        assert!(text.starts_with(r#"<html><head><meta name="offline-copy""#));
        assert!(text.contains("Hello"));
    }

    #[tokio::test]
    async fn test_html_transient_error_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>ok</p>"))
            .mount(&server)
            .await;

        let result = fetcher(ArticleFormat::Html, "https://r.jina.ai")
            .fetch(&format!("{}/post", server.uri()))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_html_404_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let result = fetcher(ArticleFormat::Html, "https://r.jina.ai")
            .fetch(&format!("{}/gone", server.uri()))
            .await;
        assert!(matches!(result, Err(FetchError::HttpStatus(404))));
    }

    #[tokio::test]
    async fn test_html_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3) // Initial request + 2 retries
            .mount(&server)
            .await;

        let result = fetcher(ArticleFormat::Html, "https://r.jina.ai")
            .fetch(&format!("{}/flaky", server.uri()))
            .await;
        assert!(matches!(result, Err(FetchError::HttpStatus(500))));
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let base = crate::util::testing::stalled_body_server().await;
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        };
        let fetcher = ArticleFetcher::new(
            reqwest::Client::new(),
            ArticleFormat::Html,
            "https://r.jina.ai",
            policy,
        );

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            fetcher.fetch(&format!("{base}/post")),
        )
        .await
        .expect("fetch must give up on a stalled body");
        assert!(matches!(result, Err(FetchError::Timeout)));
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let result = fetcher(ArticleFormat::Html, "https://r.jina.ai")
            .fetch("not-a-valid-url")
            .await;
        assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_markdown_uses_reader_proxy() {
        let server = MockServer::start().await;
        let body = format!("[Skip to content](#main)\n# Title\n\n{}", "word ".repeat(60));
        Mock::given(method("GET"))
            .and(path_regex("example.com/article$"))
            .and(header_exists("X-Target-Selector"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let result = fetcher(ArticleFormat::Markdown, &server.uri())
            .fetch("https://example.com/article")
            .await
            .unwrap();
        let (text, ext) = inline_text(result);
        assert_eq!(ext, "md");
        assert!(text.starts_with("# Title"));
        assert!(!text.contains("Skip to content"));
    }

    #[tokio::test]
    async fn test_markdown_rejects_private_hosts() {
        let result = fetcher(ArticleFormat::Markdown, "https://r.jina.ai")
            .fetch("http://192.168.1.1/article")
            .await;
        assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_markdown_rejects_insecure_reader() {
        let result = fetcher(ArticleFormat::Markdown, "http://evil.com")
            .fetch("https://example.com/article")
            .await;
        assert!(matches!(result, Err(FetchError::InsecureBaseUrl)));
    }

    #[test]
    fn test_meta_refresh_removed() {
        let html = r#"<head><META HTTP-EQUIV="Refresh" content="0; url=/x"><meta charset="utf-8"></head>"#;
        let out = remove_meta_refresh(html);
        assert!(!out.to_lowercase().contains("refresh"));
        assert!(out.contains(r#"<meta charset="utf-8">"#));
    }

    #[test]
    fn test_header_element_is_not_head() {
        let html = "<body><header>nav</header></body>";
        assert_eq!(find_head_open_end(html), None);
        assert_eq!(prepare_offline_html(html), html);
    }

    #[test]
    fn test_head_with_attributes() {
        let html = r#"<head lang="en"><title>x</title></head>"#;
        assert_eq!(find_head_open_end(html), Some(16));
    }

    #[test]
    fn test_strip_boilerplate_keeps_content() {
        let input = "Menu\n# Article\n\nLoading Comments...\nBody text";
        assert_eq!(strip_boilerplate(input), "# Article\n\nBody text");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("HTML".parse::<ArticleFormat>(), Ok(ArticleFormat::Html));
        assert_eq!("md".parse::<ArticleFormat>(), Ok(ArticleFormat::Markdown));
        assert!("pdf".parse::<ArticleFormat>().is_err());
    }
}
