//! Slack bot adapter using Web API polling
//!
//! The workspace is exposed as the bot's single guild, member channels as its
//! channels and direct-message conversations as its friends.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use imx_core::types::{AttachmentKind, IncomingMessage, OutgoingMessage};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{AdapterError, ChannelInfo, ChatBot, FriendInfo, GuildInfo};

const PLATFORM: &str = "slack";
const MAX_MESSAGE_SIZE: usize = 10_240;
pub const DEFAULT_API_BASE: &str = "https://slack.com/api";

/// Thin Slack Web API client
#[derive(Clone)]
struct SlackApi {
    client: reqwest::Client,
    token: String,
    base: String,
}

impl SlackApi {
    fn check(body: Value, method: &str) -> Result<Value> {
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let err = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(anyhow!("Slack {} error: {}", method, err));
        }
        Ok(body)
    }

    /// Call a read-style Web API method with query parameters
    async fn call(&self, method: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}/{}", self.base, method);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("Slack API HTTP error: {}", response.status()));
        }
        Self::check(response.json().await?, method)
    }

    /// Call a write-style Web API method with a JSON body
    async fn post(&self, method: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{}", self.base, method);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("Slack API HTTP error: {}", response.status()));
        }
        Self::check(response.json().await?, method)
    }

    async fn conversations(&self, types: &str) -> Result<Vec<Value>> {
        let body = self
            .call(
                "conversations.list",
                &[("types", types), ("exclude_archived", "true"), ("limit", "200")],
            )
            .await?;
        Ok(body
            .get("channels")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Slack bot adapter
pub struct SlackBot {
    api: SlackApi,
    poll_interval: Duration,
    bot_user_id: Arc<RwLock<Option<String>>>,
    team: Arc<RwLock<Option<GuildInfo>>>,
    online: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl SlackBot {
    pub fn new(bot_token: String, poll_interval: Duration) -> Result<Self> {
        Self::with_api_base(bot_token, poll_interval, DEFAULT_API_BASE)
    }

    pub fn with_api_base(bot_token: String, poll_interval: Duration, api_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            api: SlackApi {
                client,
                token: bot_token,
                base: api_base.trim_end_matches('/').to_string(),
            },
            poll_interval,
            bot_user_id: Arc::new(RwLock::new(None)),
            team: Arc::new(RwLock::new(None)),
            online: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop polling when `shutdown` is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn ensure_online(&self) -> Result<(), AdapterError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(AdapterError::Offline)
        }
    }

    fn message_body(channel: &str, msg: &OutgoingMessage, mention_all: bool) -> Value {
        let text = if mention_all {
            format!("<!channel> {}", msg.content)
        } else {
            msg.content.clone()
        };

        if msg.attachments.is_empty() {
            return json!({ "channel": channel, "text": text });
        }

        let mut blocks = vec![json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": text },
        })];
        for attachment in &msg.attachments {
            match attachment.kind {
                AttachmentKind::Image => blocks.push(json!({
                    "type": "image",
                    "image_url": attachment.locator,
                    "alt_text": "image",
                })),
            }
        }
        json!({ "channel": channel, "text": text, "blocks": blocks })
    }
}

#[async_trait]
impl ChatBot for SlackBot {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn self_id(&self) -> Option<String> {
        self.bot_user_id.read().ok().and_then(|id| id.clone())
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn start(&self, tx: mpsc::Sender<IncomingMessage>) -> Result<()> {
        info!("Starting Slack bot");

        if self.api.token.is_empty() {
            return Err(anyhow!("Slack bot token is empty"));
        }

        let auth = self.api.call("auth.test", &[]).await?;
        let bot_user_id = auth
            .get("user_id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Could not get bot user_id from auth.test"))?
            .to_string();
        let team = GuildInfo {
            id: str_field(&auth, "team_id").to_string(),
            name: str_field(&auth, "team").to_string(),
        };
        info!(
            "Slack bot authenticated as {} in workspace {}",
            bot_user_id, team.name
        );

        if let Ok(mut slot) = self.bot_user_id.write() {
            *slot = Some(bot_user_id.clone());
        }
        if let Ok(mut slot) = self.team.write() {
            *slot = Some(team);
        }
        self.online.store(true, Ordering::SeqCst);

        let api = self.api.clone();
        let poll_interval = self.poll_interval;
        let online = self.online.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            info!("Slack polling task started");

            // Per-channel high-water mark so old history is never replayed
            let mut latest_ts: HashMap<String, String> = HashMap::new();
            let mut interval = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Slack polling task shutting down");
                        online.store(false, Ordering::SeqCst);
                        break;
                    }
                    _ = interval.tick() => {}
                }
                debug!("Polling Slack for new messages");

                let channels = match api
                    .conversations("public_channel,private_channel,im")
                    .await
                {
                    Ok(channels) => channels,
                    Err(e) => {
                        error!("Error listing Slack conversations: {}", e);
                        continue;
                    }
                };

                for channel in &channels {
                    let is_im = channel.get("is_im").and_then(Value::as_bool) == Some(true);
                    let is_member = channel.get("is_member").and_then(Value::as_bool) == Some(true);
                    if !is_im && !is_member {
                        continue;
                    }
                    let channel_id = str_field(channel, "id");
                    if channel_id.is_empty() {
                        continue;
                    }

                    let oldest = latest_ts
                        .entry(channel_id.to_string())
                        .or_insert_with(|| format!("{}.000000", Utc::now().timestamp()))
                        .clone();

                    let history = match api
                        .call(
                            "conversations.history",
                            &[("channel", channel_id), ("oldest", &oldest), ("limit", "20")],
                        )
                        .await
                    {
                        Ok(h) => h,
                        Err(e) => {
                            debug!("Failed to poll channel {}: {}", channel_id, e);
                            continue;
                        }
                    };

                    let Some(messages) = history.get("messages").and_then(Value::as_array) else {
                        continue;
                    };

                    let mut max_ts = oldest.clone();
                    // History is newest first; forward in chronological order
                    for msg in messages.iter().rev() {
                        let ts = str_field(msg, "ts");
                        let user = str_field(msg, "user");
                        let text = str_field(msg, "text");

                        if ts > max_ts.as_str() {
                            max_ts = ts.to_string();
                        }
                        if user.is_empty() || user == bot_user_id || msg.get("bot_id").is_some() {
                            continue;
                        }
                        if text.is_empty() {
                            continue;
                        }
                        if text.len() > MAX_MESSAGE_SIZE {
                            warn!(
                                "Dropping oversized Slack message from {} ({} bytes, limit {} bytes)",
                                user,
                                text.len(),
                                MAX_MESSAGE_SIZE,
                            );
                            continue;
                        }

                        let incoming = IncomingMessage {
                            id: format!("{}_{}", channel_id, ts),
                            platform: PLATFORM.to_string(),
                            channel_id: channel_id.to_string(),
                            user_id: user.to_string(),
                            sender: user.to_string(),
                            content: text.to_string(),
                            private: is_im,
                            timestamp: Utc::now(),
                        };

                        debug!("Forwarding Slack message from {} ({} chars)", user, text.len());
                        if let Err(e) = tx.send(incoming).await {
                            error!("Failed to send Slack message to bus: {}", e);
                        }
                    }

                    if max_ts > oldest {
                        latest_ts.insert(channel_id.to_string(), max_ts);
                    }
                }
            }
        });

        Ok(())
    }

    async fn send_message(&self, channel_id: &str, msg: &OutgoingMessage) -> Result<(), AdapterError> {
        self.ensure_online()?;
        let body = Self::message_body(channel_id, msg, msg.mention_all);
        self.api.post("chat.postMessage", &body).await?;
        debug!("Slack message sent to {}", channel_id);
        Ok(())
    }

    async fn send_private_message(&self, user_id: &str, msg: &OutgoingMessage) -> Result<(), AdapterError> {
        self.ensure_online()?;
        let opened = self
            .api
            .post("conversations.open", &json!({ "users": user_id }))
            .await?;
        let channel_id = opened
            .get("channel")
            .map(|c| str_field(c, "id"))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("conversations.open returned no channel for {}", user_id))?;
        let body = Self::message_body(channel_id, msg, false);
        self.api.post("chat.postMessage", &body).await?;
        Ok(())
    }

    async fn guild_list(&self) -> Result<Vec<GuildInfo>, AdapterError> {
        self.ensure_online()?;
        let team = self.team.read().ok().and_then(|t| t.clone());
        Ok(team.into_iter().collect())
    }

    async fn channel_list(&self, _guild_id: &str) -> Result<Vec<ChannelInfo>, AdapterError> {
        self.ensure_online()?;
        let channels = self
            .api
            .conversations("public_channel,private_channel")
            .await?;
        Ok(channels
            .iter()
            .filter(|c| c.get("is_member").and_then(Value::as_bool) == Some(true))
            .map(|c| ChannelInfo {
                id: str_field(c, "id").to_string(),
                name: str_field(c, "name").to_string(),
            })
            .filter(|c| !c.id.is_empty())
            .collect())
    }

    async fn friend_list(&self) -> Result<Vec<FriendInfo>, AdapterError> {
        self.ensure_online()?;
        let ims = self.api.conversations("im").await?;
        let bot_id = self.self_id().unwrap_or_default();
        Ok(ims
            .iter()
            .map(|c| str_field(c, "user"))
            .filter(|user| !user.is_empty() && *user != bot_id && *user != "USLACKBOT")
            .map(|user| FriendInfo {
                id: user.to_string(),
                name: user.to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imx_core::types::Attachment;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn started_bot(server: &MockServer) -> SlackBot {
        Mock::given(method("GET"))
            .and(path("/auth.test"))
            .and(header("authorization", "Bearer xoxb-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "user_id": "UBOT",
                "team_id": "T1",
                "team": "Acme",
            })))
            .mount(server)
            .await;

        let bot = SlackBot::with_api_base("xoxb-test".into(), Duration::from_secs(3600), &server.uri())
            .unwrap();
        let (tx, _rx) = mpsc::channel(10);
        bot.start(tx).await.unwrap();
        bot
    }

    #[tokio::test]
    async fn test_polling_stops_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth.test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "user_id": "UBOT",
                "team_id": "T1",
                "team": "Acme",
            })))
            .mount(&server)
            .await;

        let shutdown = CancellationToken::new();
        let bot = SlackBot::with_api_base("xoxb-test".into(), Duration::from_secs(3600), &server.uri())
            .unwrap()
            .with_shutdown(shutdown.clone());
        let (tx, _rx) = mpsc::channel(10);
        bot.start(tx).await.unwrap();
        assert!(bot.is_online());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while bot.is_online() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_slack_empty_token() {
        let bot = SlackBot::new(String::new(), Duration::from_secs(3)).unwrap();
        let (tx, _rx) = mpsc::channel(10);
        assert!(bot.start(tx).await.is_err());
        assert!(!bot.is_online());
    }

    #[tokio::test]
    async fn test_send_before_start_is_offline() {
        let bot = SlackBot::new("xoxb-test".into(), Duration::from_secs(3)).unwrap();
        let result = bot.send_message("C1", &OutgoingMessage::text("hi")).await;
        assert!(matches!(result, Err(AdapterError::Offline)));
    }

    #[tokio::test]
    async fn test_start_exposes_workspace_as_guild() {
        let server = MockServer::start().await;
        let bot = started_bot(&server).await;

        assert!(bot.is_online());
        assert_eq!(bot.self_id().as_deref(), Some("UBOT"));
        assert_eq!(
            bot.guild_list().await.unwrap(),
            vec![GuildInfo {
                id: "T1".into(),
                name: "Acme".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_channel_list_only_member_channels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations.list"))
            .and(query_param("types", "public_channel,private_channel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "channels": [
                    {"id": "C1", "name": "general", "is_member": true},
                    {"id": "C2", "name": "random", "is_member": false},
                ],
            })))
            .mount(&server)
            .await;
        let bot = started_bot(&server).await;

        let channels = bot.channel_list("T1").await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "general");
    }

    #[tokio::test]
    async fn test_send_message_with_mention_and_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(body_partial_json(json!({
                "channel": "C1",
                "text": "<!channel> live!",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "ts": "1.0"})))
            .expect(1)
            .mount(&server)
            .await;
        let bot = started_bot(&server).await;

        let msg = OutgoingMessage {
            content: "live!".into(),
            attachments: vec![Attachment::image("https://img/cover.jpg")],
            mention_all: true,
            reply_to: None,
        };
        bot.send_message("C1", &msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "error": "channel_not_found"})),
            )
            .mount(&server)
            .await;
        let bot = started_bot(&server).await;

        let err = bot
            .send_message("CX", &OutgoingMessage::text("hi"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("channel_not_found"));
    }

    #[tokio::test]
    async fn test_friend_list_from_direct_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations.list"))
            .and(query_param("types", "im"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "channels": [
                    {"id": "D1", "is_im": true, "user": "U1"},
                    {"id": "D2", "is_im": true, "user": "USLACKBOT"},
                ],
            })))
            .mount(&server)
            .await;
        let bot = started_bot(&server).await;

        let friends = bot.friend_list().await.unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].id, "U1");
    }

    #[test]
    fn test_message_body_without_attachments() {
        let body = SlackBot::message_body("C1", &OutgoingMessage::text("hello"), false);
        assert_eq!(body, json!({"channel": "C1", "text": "hello"}));
    }
}
