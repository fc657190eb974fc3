//! Discord bot adapter using Serenity

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use imx_core::types::{AttachmentKind, IncomingMessage, OutgoingMessage};
use serenity::all::{
    ChannelId, ChannelType, Client, Context, CreateAllowedMentions, CreateEmbed, CreateMessage,
    EventHandler, GatewayIntents, GuildId, Message, Ready, UserId,
};
use serenity::gateway::GatewayError;
use serenity::http::Http;
use serenity::prelude::TypeMapKey;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{AdapterError, ChannelInfo, ChatBot, FriendInfo, GuildInfo};

const PLATFORM: &str = "discord";
const MAX_MESSAGE_SIZE: usize = 10_240;
/// Discord's maximum message length in characters
const DISCORD_MAX_LENGTH: usize = 2000;

/// Type key for storing the incoming message sender in Serenity's TypeMap
struct MessageSender;

impl TypeMapKey for MessageSender {
    type Value = mpsc::Sender<IncomingMessage>;
}

struct DiscordHandler {
    online: Arc<AtomicBool>,
    self_id: Arc<OnceLock<String>>,
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        if msg.content.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Dropping oversized Discord message from {} ({} bytes, limit {} bytes)",
                msg.author.name,
                msg.content.len(),
                MAX_MESSAGE_SIZE,
            );
            return;
        }

        let tx = {
            let data = ctx.data.read().await;
            match data.get::<MessageSender>() {
                Some(tx) => tx.clone(),
                None => {
                    error!("MessageSender not initialized in TypeMap");
                    return;
                }
            }
        };

        let incoming = IncomingMessage {
            id: msg.id.to_string(),
            platform: PLATFORM.to_string(),
            channel_id: msg.channel_id.to_string(),
            user_id: msg.author.id.to_string(),
            sender: msg.author.name.clone(),
            content: msg.content.clone(),
            private: msg.guild_id.is_none(),
            timestamp: Utc::now(),
        };

        debug!(
            "Discord message from {} in {}",
            incoming.sender, incoming.channel_id
        );

        if let Err(e) = tx.send(incoming).await {
            error!("Failed to send Discord message to bus: {}", e);
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("Discord bot connected as {}", ready.user.name);
        let _ = self.self_id.set(ready.user.id.to_string());
        self.online.store(true, Ordering::SeqCst);
    }
}

/// Discord bot adapter
pub struct DiscordBot {
    token: String,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    online: Arc<AtomicBool>,
    self_id: Arc<OnceLock<String>>,
    shutdown: CancellationToken,
}

impl DiscordBot {
    pub fn new(token: String) -> Self {
        Self {
            token,
            http: Arc::new(RwLock::new(None)),
            online: Arc::new(AtomicBool::new(false)),
            self_id: Arc::new(OnceLock::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Disconnect and stop reconnecting when `shutdown` is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    async fn http(&self) -> Result<Arc<Http>, AdapterError> {
        self.http.read().await.clone().ok_or(AdapterError::Offline)
    }

    async fn send_to(&self, channel_id: ChannelId, msg: &OutgoingMessage, mention_all: bool) -> Result<(), AdapterError> {
        let http = self.http().await?;

        let content = if mention_all {
            format!("@everyone\n{}", msg.content)
        } else {
            msg.content.clone()
        };
        let chunks = split_message(&content);
        if chunks.len() > 1 {
            debug!(
                "Message split into {} chunks due to Discord's character limit",
                chunks.len()
            );
        }

        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            let mut builder = CreateMessage::new().content(chunk);
            if i == 0 && mention_all {
                builder = builder.allowed_mentions(CreateAllowedMentions::new().everyone(true));
            }
            if i == last {
                for attachment in &msg.attachments {
                    match attachment.kind {
                        AttachmentKind::Image => {
                            builder = builder.embed(CreateEmbed::new().image(&attachment.locator));
                        }
                    }
                }
            }

            channel_id
                .send_message(&http, builder)
                .await
                .map_err(|e| anyhow!("Failed to send Discord message chunk {}: {}", i + 1, e))?;

            if i < last {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        debug!(
            "Discord message sent to channel {} ({} chunk(s))",
            channel_id,
            chunks.len()
        );
        Ok(())
    }
}

fn parse_id(raw: &str) -> Result<u64, AdapterError> {
    raw.parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .ok_or_else(|| AdapterError::Platform(anyhow!("Invalid Discord id '{}'", raw)))
}

/// Check if a serenity error represents a fatal gateway condition that should not be retried
fn is_fatal_gateway_error(err: &serenity::Error) -> bool {
    match err {
        serenity::Error::Gateway(gateway_err) => matches!(
            gateway_err,
            GatewayError::InvalidAuthentication
                | GatewayError::NoAuthentication
                | GatewayError::InvalidShardData
                | GatewayError::DisallowedGatewayIntents
                | GatewayError::InvalidGatewayIntents
        ),
        _ => false,
    }
}

/// Cut a token with no whitespace into pieces of at most `max` bytes,
/// always on a char boundary
fn hard_wrap(word: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = word;
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    pieces.push(rest);
    pieces
}

/// Split a message into chunks that fit Discord's 2000 character limit,
/// preferring line breaks and then word boundaries.
fn split_message(content: &str) -> Vec<String> {
    if content.len() <= DISCORD_MAX_LENGTH {
        return vec![content.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current_chunk = String::new();

    for line in content.lines() {
        if line.len() > DISCORD_MAX_LENGTH {
            if !current_chunk.is_empty() {
                chunks.push(std::mem::take(&mut current_chunk));
            }

            for word in line.split_whitespace().flat_map(|w| hard_wrap(w, DISCORD_MAX_LENGTH)) {
                if current_chunk.len() + word.len() + 1 > DISCORD_MAX_LENGTH
                    && !current_chunk.is_empty()
                {
                    chunks.push(std::mem::take(&mut current_chunk));
                }
                if !current_chunk.is_empty() {
                    current_chunk.push(' ');
                }
                current_chunk.push_str(word);
            }
            continue;
        }

        let separator = if current_chunk.is_empty() { 0 } else { 1 };
        if current_chunk.len() + separator + line.len() > DISCORD_MAX_LENGTH {
            chunks.push(std::mem::replace(&mut current_chunk, line.to_string()));
        } else {
            if separator == 1 {
                current_chunk.push('\n');
            }
            current_chunk.push_str(line);
        }
    }

    if !current_chunk.is_empty() {
        chunks.push(current_chunk);
    }

    chunks
}

#[async_trait]
impl ChatBot for DiscordBot {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn self_id(&self) -> Option<String> {
        self.self_id.get().cloned()
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn start(&self, tx: mpsc::Sender<IncomingMessage>) -> Result<()> {
        info!("Starting Discord bot");

        let token = self.token.clone();
        let http_slot = self.http.clone();
        let online = self.online.clone();
        let self_id = self.self_id.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(60);
            let mut attempt = 0;

            loop {
                attempt += 1;
                info!("Discord client starting (attempt #{})", attempt);

                let intents = GatewayIntents::GUILDS
                    | GatewayIntents::GUILD_MESSAGES
                    | GatewayIntents::DIRECT_MESSAGES
                    | GatewayIntents::MESSAGE_CONTENT;

                let handler = DiscordHandler {
                    online: online.clone(),
                    self_id: self_id.clone(),
                };
                let mut client = match Client::builder(&token, intents)
                    .event_handler(handler)
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        if is_fatal_gateway_error(&e) {
                            error!("Discord fatal error (will not retry): {}", e);
                            break;
                        }
                        error!("Failed to create Discord client: {}", e);
                        warn!("Retrying in {:?}...", backoff);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(max_backoff);
                        continue;
                    }
                };

                {
                    let mut data = client.data.write().await;
                    data.insert::<MessageSender>(tx.clone());
                }
                *http_slot.write().await = Some(client.http.clone());

                let shard_manager = client.shard_manager.clone();
                let result = tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Disconnecting Discord client");
                        shard_manager.shutdown_all().await;
                        online.store(false, Ordering::SeqCst);
                        break;
                    }
                    result = client.start() => result,
                };
                online.store(false, Ordering::SeqCst);
                match result {
                    Ok(()) => {
                        info!("Discord client stopped cleanly");
                        break;
                    }
                    Err(e) => {
                        if is_fatal_gateway_error(&e) {
                            error!("Discord fatal error (will not retry): {}", e);
                            error!(
                                "Check the bot token and intents at https://discord.com/developers/applications"
                            );
                            break;
                        }
                        error!("Discord client error: {}", e);
                        warn!("Retrying in {:?}...", backoff);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(max_backoff);
                    }
                }
            }

            info!("Discord client task exiting");
        });

        Ok(())
    }

    async fn send_message(&self, channel_id: &str, msg: &OutgoingMessage) -> Result<(), AdapterError> {
        let channel = ChannelId::new(parse_id(channel_id)?);
        self.send_to(channel, msg, msg.mention_all).await
    }

    async fn send_private_message(&self, user_id: &str, msg: &OutgoingMessage) -> Result<(), AdapterError> {
        let http = self.http().await?;
        let user = UserId::new(parse_id(user_id)?);
        let dm = user
            .create_dm_channel(&http)
            .await
            .map_err(|e| anyhow!("Failed to open DM with {}: {}", user_id, e))?;
        self.send_to(dm.id, msg, false).await
    }

    async fn guild_list(&self) -> Result<Vec<GuildInfo>, AdapterError> {
        let http = self.http().await?;
        let guilds = http
            .get_guilds(None, None)
            .await
            .map_err(|e| anyhow!("Failed to list Discord guilds: {}", e))?;
        Ok(guilds
            .into_iter()
            .map(|g| GuildInfo {
                id: g.id.to_string(),
                name: g.name,
            })
            .collect())
    }

    async fn channel_list(&self, guild_id: &str) -> Result<Vec<ChannelInfo>, AdapterError> {
        let http = self.http().await?;
        let guild = GuildId::new(parse_id(guild_id)?);
        let channels = guild
            .channels(&http)
            .await
            .map_err(|e| anyhow!("Failed to list channels of guild {}: {}", guild_id, e))?;
        Ok(channels
            .into_values()
            .filter(|c| c.kind == ChannelType::Text)
            .map(|c| ChannelInfo {
                id: c.id.to_string(),
                name: c.name,
            })
            .collect())
    }

    async fn friend_list(&self) -> Result<Vec<FriendInfo>, AdapterError> {
        Err(AdapterError::Unsupported("friend list"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discord_creation() {
        let bot = DiscordBot::new("test-token".to_string());
        assert_eq!(bot.platform(), "discord");
        assert!(!bot.is_online());
        assert!(bot.self_id().is_none());
    }

    #[tokio::test]
    async fn test_send_before_start_is_offline() {
        let bot = DiscordBot::new("test-token".to_string());
        let result = bot.send_message("123", &OutgoingMessage::text("hi")).await;
        assert!(matches!(result, Err(AdapterError::Offline)));
        assert!(matches!(
            bot.friend_list().await,
            Err(AdapterError::Unsupported(_))
        ));
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("123456789").unwrap(), 123456789);
        assert!(parse_id("not-a-number").is_err());
        assert!(parse_id("0").is_err());
    }

    #[test]
    fn test_split_message_short() {
        let short_msg = "Hello, world!";
        let chunks = split_message(short_msg);
        assert_eq!(chunks, vec![short_msg.to_string()]);
    }

    #[test]
    fn test_split_message_at_limit() {
        let msg = "a".repeat(DISCORD_MAX_LENGTH);
        let chunks = split_message(&msg);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), DISCORD_MAX_LENGTH);
    }

    #[test]
    fn test_split_message_long() {
        let line = "a".repeat(100);
        let msg = format!("{}\n", line).repeat(25);
        let chunks = split_message(&msg);

        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= DISCORD_MAX_LENGTH);
        }
    }

    #[test]
    fn test_split_message_very_long_line() {
        let long_line = (0..600).map(|_| "word").collect::<Vec<_>>().join(" ");
        let chunks = split_message(&long_line);

        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= DISCORD_MAX_LENGTH);
        }
    }

    #[test]
    fn test_split_message_token_without_spaces() {
        let token = "a".repeat(DISCORD_MAX_LENGTH * 2 + 500);
        let chunks = split_message(&token);

        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.len() <= DISCORD_MAX_LENGTH);
        }
        assert_eq!(chunks.concat(), token);
    }

    #[test]
    fn test_hard_wrap_respects_char_boundaries() {
        // Two bytes per char, so the limit lands mid-char when odd
        let token = "é".repeat(1500);
        let pieces = hard_wrap(&token, 1001);

        assert!(pieces.iter().all(|p| p.len() <= 1001));
        assert_eq!(pieces[0].len(), 1000);
        assert_eq!(pieces.concat(), token);
    }
}
