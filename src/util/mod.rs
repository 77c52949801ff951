//! Shared helpers used by the catalog client, the content fetchers and the
//! executor.
//!
//! - **Backoff**: bounded exponential retry policy for network calls
//! - **HTTP**: size-limited, completeness-checked body reads
//! - **File names**: portable names for saved content
//! - **URL validation**: scheme and host policy for content URLs

mod backoff;
mod filename;
mod http;
mod url_validator;

pub use backoff::RetryPolicy;
pub use filename::{content_file_name, sanitize_filename};
pub use http::{read_limited_bytes, LimitedReadError};
#[cfg(test)]
pub(crate) use http::testing;
pub use url_validator::{validate_url, HostPolicy, UrlValidationError};
