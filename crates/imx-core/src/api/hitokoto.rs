//! Hitokoto random quote API

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use super::{ApiError, build_client, check_status};

pub const DEFAULT_BASE_URL: &str = "https://v1.hitokoto.cn";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Hitokoto {
    pub hitokoto: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub from_who: Option<String>,
}

impl Hitokoto {
    /// Used when the service is unreachable
    pub fn fallback() -> Self {
        Self {
            hitokoto: "Keep going today!".to_string(),
            from: "imx".to_string(),
            from_who: None,
        }
    }
}

impl std::fmt::Display for Hitokoto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hitokoto)?;
        match (self.from.is_empty(), self.from_who.as_deref()) {
            (false, Some(who)) if !who.is_empty() => write!(f, " -- {}「{}」", who, self.from),
            (false, _) => write!(f, " --「{}」", self.from),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HitokotoClient {
    client: Client,
    base_url: String,
}

impl HitokotoClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_client(Duration::from_secs(5))?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn fetch(&self) -> Result<Hitokoto, ApiError> {
        let response = self.client.get(format!("{}/", self.base_url)).send().await?;
        Ok(check_status(response)?.json().await?)
    }

    /// Fetch a quote, falling back to a fixed one on any error
    pub async fn fetch_or_fallback(&self) -> Hitokoto {
        match self.fetch().await {
            Ok(quote) => quote,
            Err(e) => {
                warn!("Failed to fetch hitokoto: {}", e);
                Hitokoto::fallback()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 1,
                "hitokoto": "Stay curious.",
                "from": "Notebook",
                "from_who": "Someone",
            })))
            .mount(&server)
            .await;

        let client = HitokotoClient::with_base_url(server.uri()).unwrap();
        let quote = client.fetch().await.unwrap();
        assert_eq!(quote.hitokoto, "Stay curious.");
        assert_eq!(quote.to_string(), "Stay curious. -- Someone「Notebook」");
    }

    #[tokio::test]
    async fn test_fallback_on_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HitokotoClient::with_base_url(server.uri()).unwrap();
        assert_eq!(client.fetch_or_fallback().await, Hitokoto::fallback());
    }
}
