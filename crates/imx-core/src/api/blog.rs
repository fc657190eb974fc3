//! Blog (mx-space) REST client

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{ApiError, build_client, check_status};
use crate::events::blog::{Note, Page, Post, SiteInfo};

/// How long the aggregate (owner, site title, front-end URL) is reused
pub const AGGREGATE_TTL: Duration = Duration::from_secs(5 * 60);

/// Lookups needed to format blog events
#[async_trait]
pub trait BlogApi: Send + Sync {
    async fn site_info(&self) -> Result<SiteInfo, ApiError>;
    async fn get_post(&self, id: &str) -> Result<Post, ApiError>;
    async fn get_note(&self, id: &str) -> Result<Note, ApiError>;
    async fn get_page(&self, id: &str) -> Result<Page, ApiError>;
    /// Front-end URL of any document, via the blog's url-builder helper
    async fn resolve_url(&self, id: &str) -> Result<String, ApiError>;
}

#[derive(Debug, Deserialize)]
struct Aggregate {
    user: AggregateUser,
    seo: AggregateSeo,
    url: AggregateUrl,
}

#[derive(Debug, Deserialize)]
struct AggregateUser {
    name: String,
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct AggregateSeo {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregateUrl {
    web_url: String,
}

impl From<Aggregate> for SiteInfo {
    fn from(a: Aggregate) -> Self {
        Self {
            owner_name: a.user.name,
            owner_username: a.user.username,
            site_title: a.seo.title,
            web_url: a.url.web_url,
        }
    }
}

pub struct BlogClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    cache_ttl: Duration,
    aggregate: Mutex<Option<(Instant, SiteInfo)>>,
}

impl std::fmt::Debug for BlogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlogClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl BlogClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_client(Duration::from_secs(10))?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            cache_ttl: AGGREGATE_TTL,
            aggregate: Mutex::new(None),
        })
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    async fn get_json(&self, path: &str) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .get(&url)
            .header("x-request-id", uuid::Uuid::new_v4().simple().to_string());
        if let Some(token) = &self.token {
            request = request.header("authorization", token);
        }
        debug!("GET {}", url);
        let response = check_status(request.send().await?)?;
        Ok(response.json().await?)
    }

    async fn get_model<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let value = unwrap_data(self.get_json(path).await?);
        serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    fn cached_site(&self) -> Option<SiteInfo> {
        let guard = self.aggregate.lock().ok()?;
        guard
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.cache_ttl)
            .map(|(_, site)| site.clone())
    }
}

/// Some endpoints wrap the document as `{data: {...}, prev, next}`
fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut map) if !map.contains_key("title") && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[async_trait]
impl BlogApi for BlogClient {
    async fn site_info(&self) -> Result<SiteInfo, ApiError> {
        if let Some(site) = self.cached_site() {
            return Ok(site);
        }
        let aggregate: Aggregate = serde_json::from_value(self.get_json("/aggregate").await?)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        let site = SiteInfo::from(aggregate);
        if let Ok(mut guard) = self.aggregate.lock() {
            *guard = Some((Instant::now(), site.clone()));
        }
        Ok(site)
    }

    async fn get_post(&self, id: &str) -> Result<Post, ApiError> {
        self.get_model(&format!("/posts/{}", urlencoding::encode(id))).await
    }

    async fn get_note(&self, id: &str) -> Result<Note, ApiError> {
        self.get_model(&format!("/notes/{}", urlencoding::encode(id))).await
    }

    async fn get_page(&self, id: &str) -> Result<Page, ApiError> {
        self.get_model(&format!("/pages/{}", urlencoding::encode(id))).await
    }

    async fn resolve_url(&self, id: &str) -> Result<String, ApiError> {
        let value = self
            .get_json(&format!("/helper/url-builder/{}", urlencoding::encode(id)))
            .await?;
        let url = match &value {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("data").and_then(Value::as_str),
            _ => None,
        };
        url.filter(|u| !u.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ApiError::InvalidResponse(format!("no url for {}", id)))
    }
}
