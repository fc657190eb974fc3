//! Clients for the external HTTP services the bot talks to
//!
//! Each client owns its `reqwest::Client` and any caches; there is no shared
//! global state between them. Base URLs are injectable so tests can point
//! them at a mock server.

pub mod bilibili;
pub mod blog;
pub mod hitokoto;
pub mod ip;

use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

pub use bilibili::{BilibiliClient, LiveApi, LiveStatus};
pub use blog::{BlogApi, BlogClient};
pub use hitokoto::{Hitokoto, HitokotoClient};
pub use ip::{IpInfo, IpLookup};

/// Browser user agent; some upstreams reject obvious bot agents
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    /// The service answered but reported an error in its body
    #[error("service error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub(crate) fn build_client(timeout: Duration) -> Result<Client, ApiError> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(BROWSER_USER_AGENT)
        .build()?)
}

/// Turn a non-2xx response into `ApiError::Status`
pub(crate) fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ApiError::Status {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}
