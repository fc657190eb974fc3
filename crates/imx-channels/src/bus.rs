//! Chat bot registry and the inbound message stream

use anyhow::Result;
use async_trait::async_trait;
use imx_core::types::{IncomingMessage, OutgoingMessage};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The platform has no such concept (e.g. friend lists on Slack)
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("bot is not connected")]
    Offline,

    #[error(transparent)]
    Platform(#[from] anyhow::Error),
}

/// A connected bot account on one chat platform
#[async_trait]
pub trait ChatBot: Send + Sync {
    /// Platform name used in qualified channel ids (`discord:1234`)
    fn platform(&self) -> &str;

    /// The bot's own user id once connected
    fn self_id(&self) -> Option<String>;

    fn is_online(&self) -> bool;

    /// Start listening, forwarding incoming chat messages to `tx`.
    /// Implementations spawn their own task and return once it is running.
    async fn start(&self, tx: mpsc::Sender<IncomingMessage>) -> Result<()>;

    async fn send_message(&self, channel_id: &str, msg: &OutgoingMessage) -> Result<(), AdapterError>;

    async fn send_private_message(&self, user_id: &str, msg: &OutgoingMessage) -> Result<(), AdapterError>;

    async fn guild_list(&self) -> Result<Vec<GuildInfo>, AdapterError>;

    async fn channel_list(&self, guild_id: &str) -> Result<Vec<ChannelInfo>, AdapterError>;

    async fn friend_list(&self) -> Result<Vec<FriendInfo>, AdapterError>;
}

/// Owns the registered bots and the receiving end of their message stream
pub struct MessageBus {
    bots: Vec<Arc<dyn ChatBot>>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    incoming_rx: mpsc::Receiver<IncomingMessage>,
}

impl MessageBus {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        info!("Created message bus with buffer size {}", buffer_size);
        Self {
            bots: Vec::new(),
            incoming_tx: tx,
            incoming_rx: rx,
        }
    }

    /// Register a bot. Registration order decides which bot handles bare
    /// channel ids.
    pub fn register(&mut self, bot: Arc<dyn ChatBot>) {
        info!("Registering {} bot", bot.platform());
        self.bots.push(bot);
    }

    /// Start every registered bot. A bot that fails to start is logged and
    /// skipped; the others keep running. Returns how many started.
    pub async fn start_all(&self) -> usize {
        info!("Starting {} registered bot(s)", self.bots.len());

        let mut started = 0;
        for bot in &self.bots {
            debug!("Starting {} bot", bot.platform());
            match bot.start(self.incoming_tx.clone()).await {
                Ok(()) => {
                    info!("Started {} bot", bot.platform());
                    started += 1;
                }
                Err(e) => error!("Failed to start {} bot: {:#}", bot.platform(), e),
            }
        }
        started
    }

    pub fn bot_count(&self) -> usize {
        self.bots.len()
    }

    /// Split into the inbound receiver and a cloneable handle to the bots
    pub fn split(self) -> (mpsc::Receiver<IncomingMessage>, BusSender) {
        let sender = BusSender {
            bots: Arc::from(self.bots),
        };
        (self.incoming_rx, sender)
    }
}

/// Cloneable handle to the registered bots
#[derive(Clone)]
pub struct BusSender {
    bots: Arc<[Arc<dyn ChatBot>]>,
}

impl BusSender {
    pub fn new(bots: Vec<Arc<dyn ChatBot>>) -> Self {
        Self {
            bots: Arc::from(bots),
        }
    }

    pub fn bots(&self) -> &[Arc<dyn ChatBot>] {
        &self.bots
    }

    /// Bots currently connected, in registration order
    pub fn online_bots(&self) -> Vec<Arc<dyn ChatBot>> {
        self.bots.iter().filter(|b| b.is_online()).cloned().collect()
    }

    /// First online bot, optionally restricted to one platform
    pub fn first_online(&self, platform: Option<&str>) -> Option<Arc<dyn ChatBot>> {
        self.bots
            .iter()
            .filter(|b| b.is_online())
            .find(|b| platform.is_none_or(|p| b.platform() == p))
            .cloned()
    }

    /// Answer an incoming message in the conversation it came from
    pub async fn reply(&self, to: &IncomingMessage, msg: OutgoingMessage) -> Result<(), AdapterError> {
        let bot = self
            .first_online(Some(&to.platform))
            .ok_or(AdapterError::Offline)?;
        let msg = OutgoingMessage {
            reply_to: msg.reply_to.or_else(|| Some(to.id.clone())),
            ..msg
        };
        if to.private {
            bot.send_private_message(&to.user_id, &msg).await
        } else {
            bot.send_message(&to.channel_id, &msg).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockBot {
        platform: &'static str,
        online: AtomicBool,
        fail_start: bool,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl MockBot {
        fn new(platform: &'static str, online: bool) -> Self {
            Self {
                platform,
                online: AtomicBool::new(online),
                fail_start: false,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatBot for MockBot {
        fn platform(&self) -> &str {
            self.platform
        }

        fn self_id(&self) -> Option<String> {
            Some("bot".into())
        }

        fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        async fn start(&self, _tx: mpsc::Sender<IncomingMessage>) -> Result<()> {
            if self.fail_start {
                anyhow::bail!("bad token");
            }
            self.online.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send_message(&self, channel_id: &str, msg: &OutgoingMessage) -> Result<(), AdapterError> {
            self.sent
                .lock()
                .unwrap()
                .push((format!("channel:{}", channel_id), msg.content.clone()));
            Ok(())
        }

        async fn send_private_message(&self, user_id: &str, msg: &OutgoingMessage) -> Result<(), AdapterError> {
            self.sent
                .lock()
                .unwrap()
                .push((format!("user:{}", user_id), msg.content.clone()));
            Ok(())
        }

        async fn guild_list(&self) -> Result<Vec<GuildInfo>, AdapterError> {
            Ok(vec![])
        }

        async fn channel_list(&self, _guild_id: &str) -> Result<Vec<ChannelInfo>, AdapterError> {
            Ok(vec![])
        }

        async fn friend_list(&self) -> Result<Vec<FriendInfo>, AdapterError> {
            Err(AdapterError::Unsupported("friend list"))
        }
    }

    fn incoming(platform: &str, private: bool) -> IncomingMessage {
        IncomingMessage {
            id: "m1".into(),
            platform: platform.into(),
            channel_id: "C1".into(),
            user_id: "U1".into(),
            sender: "alice".into(),
            content: "/health".into(),
            private,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_bus_register() {
        let mut bus = MessageBus::new(32);
        bus.register(Arc::new(MockBot::new("discord", false)));
        bus.register(Arc::new(MockBot::new("slack", false)));
        assert_eq!(bus.bot_count(), 2);
    }

    #[tokio::test]
    async fn test_start_all_skips_failures() {
        let mut bus = MessageBus::new(32);
        let mut broken = MockBot::new("discord", false);
        broken.fail_start = true;
        bus.register(Arc::new(broken));
        bus.register(Arc::new(MockBot::new("slack", false)));

        assert_eq!(bus.start_all().await, 1);
        let (_rx, sender) = bus.split();
        assert_eq!(sender.online_bots().len(), 1);
        assert_eq!(
            sender.first_online(None).map(|b| b.platform().to_string()),
            Some("slack".to_string())
        );
    }

    #[test]
    fn test_first_online_by_platform() {
        let sender = BusSender::new(vec![
            Arc::new(MockBot::new("discord", false)),
            Arc::new(MockBot::new("slack", true)),
            Arc::new(MockBot::new("discord", true)),
        ]);
        assert_eq!(sender.first_online(None).unwrap().platform(), "slack");
        assert!(sender.first_online(Some("discord")).is_some());
        assert!(sender.first_online(Some("qq")).is_none());
    }

    #[tokio::test]
    async fn test_reply_routes_by_conversation_kind() {
        let bot = Arc::new(MockBot::new("slack", true));
        let sender = BusSender::new(vec![bot.clone()]);

        sender
            .reply(&incoming("slack", false), OutgoingMessage::text("pong"))
            .await
            .unwrap();
        sender
            .reply(&incoming("slack", true), OutgoingMessage::text("pong"))
            .await
            .unwrap();

        let sent = bot.sent.lock().unwrap();
        assert_eq!(sent[0].0, "channel:C1");
        assert_eq!(sent[1].0, "user:U1");
    }

    #[tokio::test]
    async fn test_reply_without_bot_fails() {
        let sender = BusSender::new(vec![Arc::new(MockBot::new("slack", true))]);
        let result = sender
            .reply(&incoming("discord", false), OutgoingMessage::text("pong"))
            .await;
        assert!(matches!(result, Err(AdapterError::Offline)));
    }

    #[tokio::test]
    async fn test_incoming_messages() {
        let bus = MessageBus::new(32);
        let tx = bus.incoming_tx.clone();
        let (mut rx, _sender) = bus.split();

        tx.send(incoming("discord", false)).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.session_key(), "discord:C1");
    }
}
