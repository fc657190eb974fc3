//! Webhook server: Axum-based HTTP endpoints for GitHub and blog webhooks

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, bail};
use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use imx_channels::Dispatcher;
use imx_core::api::BlogApi;
use imx_core::events::blog::enrich;
use imx_core::{BlogEvent, BlogNormalizer, DispatchPolicy, GithubEvent, NotificationRecord, SiteInfo};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::protocol::{ErrorBody, StatusReport, WebhookAck};
use crate::signature::{signature_from_headers, verify};

pub const DEFAULT_GITHUB_PATH: &str = "/github/webhook";
pub const DEFAULT_BLOG_PATH: &str = "/mx/webhook";
pub const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;
const STATUS_PATH: &str = "/api/status";

/// GitHub webhook endpoint settings
#[derive(Debug, Clone)]
pub struct GithubHook {
    pub path: String,
    /// When set, requests must carry a valid HMAC signature
    pub secret: Option<String>,
    pub policy: DispatchPolicy,
}

/// Blog webhook endpoint settings
pub struct BlogHook {
    pub path: String,
    pub secret: Option<String>,
    pub policy: DispatchPolicy,
    pub normalizer: BlogNormalizer,
    /// Used to resolve referenced posts and the live site details
    pub api: Option<Arc<dyn BlogApi>>,
    /// Used when no API is configured or the aggregate lookup fails
    pub site: SiteInfo,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("{0}")]
    BadRequest(String),

    #[error("invalid or missing signature")]
    Unauthorized,

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, axum::Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

/// Shared state for all requests
#[derive(Clone)]
pub struct GatewayState {
    pub github: Option<Arc<GithubHook>>,
    pub blog: Option<Arc<BlogHook>>,
    pub dispatcher: Arc<Dispatcher>,
    pub start_time: Instant,
}

/// The webhook server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
    max_body_bytes: usize,
}

impl GatewayServer {
    pub fn new(bind: SocketAddr, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            state: GatewayState {
                github: None,
                blog: None,
                dispatcher,
                start_time: Instant::now(),
            },
            bind,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_github(mut self, hook: GithubHook) -> Self {
        self.state.github = Some(Arc::new(hook));
        self
    }

    pub fn with_blog(mut self, hook: BlogHook) -> Self {
        self.state.blog = Some(Arc::new(hook));
        self
    }

    pub fn with_body_limit(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Build the Axum router. Fails on hook paths that would collide.
    pub fn router(&self) -> anyhow::Result<Router> {
        let mut paths = vec![STATUS_PATH];
        let mut router = Router::new().route(STATUS_PATH, get(status_handler));

        if let Some(github) = &self.state.github {
            check_path(&github.path, &paths)?;
            paths.push(&github.path);
            router = router.route(&github.path, post(github_handler));
        }
        if let Some(blog) = &self.state.blog {
            check_path(&blog.path, &paths)?;
            router = router.route(&blog.path, post(blog_handler));
        }

        Ok(router
            .layer(DefaultBodyLimit::max(self.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone()))
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("Failed to bind webhook server to {}", self.bind))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` is cancelled
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let router = self.router()?;
        info!("Webhook server listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Webhook server stopped");
        Ok(())
    }

    /// Start the server in the background, returning a handle
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

fn check_path(path: &str, taken: &[&str]) -> anyhow::Result<()> {
    if !path.starts_with('/') {
        bail!("Webhook path '{}' must start with '/'", path);
    }
    if taken.contains(&path) {
        bail!("Webhook path '{}' is already in use", path);
    }
    Ok(())
}

// ── HTTP Handlers ──

async fn status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let bots = state.dispatcher.bots();
    let hooks = state
        .github
        .iter()
        .map(|h| format!("github {}", h.path))
        .chain(state.blog.iter().map(|h| format!("blog {}", h.path)))
        .collect();

    axum::Json(StatusReport {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        bots_online: bots.online_bots().len(),
        bots_registered: bots.bots().len(),
        hooks,
    })
}

async fn github_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let Some(hook) = state.github.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let body = match read_body(body) {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };
    respond(process_github(hook, &state.dispatcher, &headers, &body).await)
}

async fn blog_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let Some(hook) = state.blog.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let body = match read_body(body) {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };
    respond(process_blog(hook, &state.dispatcher, &headers, &body).await)
}

/// Body read failures (including the size limit) answer with the JSON error body
fn read_body(body: Result<Bytes, BytesRejection>) -> Result<Bytes, WebhookError> {
    body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            warn!("Rejecting webhook body over the size limit");
            WebhookError::BadRequest("request body too large".to_string())
        } else {
            WebhookError::BadRequest(rejection.body_text())
        }
    })
}

fn respond(result: Result<WebhookAck, WebhookError>) -> Response {
    match result {
        Ok(ack) => axum::Json(ack).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Webhook processing ──

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn authenticate(secret: Option<&str>, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let Some((algorithm, provided)) = signature_from_headers(headers) else {
        warn!("Rejecting webhook without a signature header");
        return Err(WebhookError::Unauthorized);
    };
    if !verify(body, secret, provided, algorithm) {
        warn!("Rejecting webhook with a bad {:?} signature", algorithm);
        return Err(WebhookError::Unauthorized);
    }
    Ok(())
}

async fn deliver(
    dispatcher: &Dispatcher,
    record: &NotificationRecord,
    policy: &DispatchPolicy,
) -> Result<WebhookAck, WebhookError> {
    match dispatcher.dispatch(record, policy).await {
        Ok(report) => Ok(WebhookAck::delivered(report.sent, report.failed)),
        Err(e) => Err(WebhookError::Internal(e.to_string())),
    }
}

/// Handle one GitHub delivery from raw headers and body
pub async fn process_github(
    hook: &GithubHook,
    dispatcher: &Dispatcher,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<WebhookAck, WebhookError> {
    if body.is_empty() {
        return Err(WebhookError::BadRequest("empty body".into()));
    }
    authenticate(hook.secret.as_deref(), headers, body)?;

    let event_name = header_str(headers, "x-github-event")
        .ok_or_else(|| WebhookError::BadRequest("missing X-GitHub-Event header".into()))?;

    let event = match GithubEvent::decode(event_name, body) {
        Ok(Some(event)) => event,
        Ok(None) => return Ok(WebhookAck::ignored()),
        Err(e) if e.is_structural() => {
            warn!("Ignoring GitHub {} webhook: {}", event_name, e);
            return Ok(WebhookAck::ignored());
        }
        Err(e) => return Err(WebhookError::BadRequest(e.to_string())),
    };

    let Some(record) = event.normalize() else {
        debug!("GitHub {} event produced no notification", event.source_kind());
        return Ok(WebhookAck::ignored());
    };
    deliver(dispatcher, &record, &hook.policy).await
}

/// Handle one blog delivery from raw headers and body
pub async fn process_blog(
    hook: &BlogHook,
    dispatcher: &Dispatcher,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<WebhookAck, WebhookError> {
    if body.is_empty() {
        return Err(WebhookError::BadRequest("empty body".into()));
    }
    authenticate(hook.secret.as_deref(), headers, body)?;

    let event_header = header_str(headers, "x-webhook-event");
    let mut event = match BlogEvent::decode(event_header, body) {
        Ok(Some(event)) => event,
        Ok(None) => return Ok(WebhookAck::ignored()),
        Err(e) if e.is_structural() => {
            warn!("Ignoring blog webhook: {}", e);
            return Ok(WebhookAck::ignored());
        }
        Err(e) => return Err(WebhookError::BadRequest(e.to_string())),
    };

    let site = match &hook.api {
        Some(api) => {
            enrich(&mut event, api.as_ref()).await;
            match api.site_info().await {
                Ok(site) => site,
                Err(e) => {
                    warn!("Blog aggregate lookup failed, using configured site: {}", e);
                    hook.site.clone()
                }
            }
        }
        None => hook.site.clone(),
    };

    let Some(record) = hook.normalizer.normalize(&event, &site, Utc::now()) else {
        debug!("Blog {} event produced no notification", event.source_kind());
        return Ok(WebhookAck::ignored());
    };
    deliver(dispatcher, &record, &hook.policy).await
}
