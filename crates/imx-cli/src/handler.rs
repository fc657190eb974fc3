//! Inbound chat handling: commands first, then the repeater

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use imx_channels::{AdapterError, BusSender, Dispatcher};
use imx_core::api::{HitokotoClient, IpLookup, LiveApi, LiveStatus};
use imx_core::commands::{self, Command, CommandError};
use imx_core::events::live::room_url;
use imx_core::{
    DispatchPolicy, IncomingMessage, NotificationRecord, OutgoingMessage, RepeatAction, RepeatConfig,
    RepeatDetector, SourceKind,
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{RepeaterConfig, ToolsConfig};

pub const TEST_NOTIFICATION: &str = "This is a test notification from imx.";

/// Repeat detection plus the chance of actually joining in
pub struct RepeatPolicy {
    detector: Mutex<RepeatDetector>,
    probability: f64,
    break_message: String,
}

impl RepeatPolicy {
    pub fn new(config: &RepeaterConfig) -> Self {
        Self {
            detector: Mutex::new(RepeatDetector::new(RepeatConfig {
                repeat_threshold: config.repeat_threshold,
                break_threshold: config.break_threshold,
                max_sessions: config.max_sessions,
            })),
            probability: config.probability.clamp(0.0, 1.0),
            break_message: config.break_message.clone(),
        }
    }

    /// What to send in response to `msg`, if anything
    fn respond(&self, msg: &IncomingMessage) -> Option<String> {
        let action = match self.detector.lock() {
            Ok(mut detector) => detector.observe(&msg.session_key(), &msg.content),
            Err(poisoned) => poisoned.into_inner().observe(&msg.session_key(), &msg.content),
        };
        match action {
            RepeatAction::None => None,
            RepeatAction::ShouldRepeat => {
                rand::thread_rng().gen_bool(self.probability).then(|| msg.content.clone())
            }
            RepeatAction::ShouldBreak => Some(self.break_message.clone()),
        }
    }
}

/// Live room settings the `bili.status` command needs
pub struct LiveLookup {
    pub api: Arc<dyn LiveApi>,
    pub default_room: Option<String>,
}

pub struct MessageHandler {
    bots: BusSender,
    dispatcher: Arc<Dispatcher>,
    tools: ToolsConfig,
    repeater: Option<RepeatPolicy>,
    quotes: HitokotoClient,
    ip: IpLookup,
    live: Option<LiveLookup>,
    github_policy: Option<DispatchPolicy>,
    start_time: Instant,
}

impl MessageHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, tools: ToolsConfig) -> Result<Self> {
        Ok(Self {
            bots: dispatcher.bots().clone(),
            dispatcher,
            tools,
            repeater: None,
            quotes: HitokotoClient::new()?,
            ip: IpLookup::new()?,
            live: None,
            github_policy: None,
            start_time: Instant::now(),
        })
    }

    pub fn with_repeater(mut self, repeater: RepeatPolicy) -> Self {
        self.repeater = Some(repeater);
        self
    }

    pub fn with_live(mut self, live: LiveLookup) -> Self {
        self.live = Some(live);
        self
    }

    pub fn with_github_policy(mut self, policy: DispatchPolicy) -> Self {
        self.github_policy = Some(policy);
        self
    }

    pub async fn handle(&self, msg: IncomingMessage) -> Result<(), AdapterError> {
        if self.is_own_message(&msg) {
            debug!("Ignoring own message in {}", msg.session_key());
            return Ok(());
        }

        if let Some(parsed) = commands::parse(&self.tools.command_prefix, &msg.content) {
            let Some(reply) = self.run_command(parsed).await else {
                return Ok(());
            };
            return self.bots.reply(&msg, OutgoingMessage::text(reply)).await;
        }

        if msg.private || msg.content.trim().is_empty() {
            return Ok(());
        }
        if let Some(text) = self.repeater.as_ref().and_then(|r| r.respond(&msg)) {
            info!("Repeater firing in {}", msg.session_key());
            let bot = self
                .bots
                .first_online(Some(&msg.platform))
                .ok_or(AdapterError::Offline)?;
            bot.send_message(&msg.channel_id, &OutgoingMessage::text(text)).await?;
        }
        Ok(())
    }

    fn is_own_message(&self, msg: &IncomingMessage) -> bool {
        self.bots
            .bots()
            .iter()
            .filter(|b| b.platform() == msg.platform)
            .any(|b| b.self_id().as_deref() == Some(msg.user_id.as_str()))
    }

    /// Reply text for a parsed command; `None` means stay quiet
    async fn run_command(&self, parsed: Result<Command, CommandError>) -> Option<String> {
        let command = match parsed {
            Ok(command) => command,
            Err(e) => return Some(e.to_string()),
        };
        debug!("Running command {:?}", command);

        match command {
            Command::Hitokoto => Some(self.quotes.fetch_or_fallback().await.to_string()),
            Command::Health => Some(self.health()),
            Command::BiliStatus { room } => Some(self.live_status(room).await),
            Command::GithubTest => Some(self.github_test().await),
            Command::ToolIp(_) | Command::ToolBase64 { .. } | Command::ToolMd5(_) if !self.tools.enabled => None,
            Command::ToolIp(addr) => Some(match self.ip.lookup(addr).await {
                Ok(info) => info.summary(),
                Err(e) => {
                    warn!("IP lookup for {} failed: {}", addr, e);
                    format!("Lookup failed: {}", e)
                }
            }),
            Command::ToolBase64 { decode: false, text } => Some(commands::base64_encode(&text)),
            Command::ToolBase64 { decode: true, text } => {
                Some(commands::base64_decode(&text).unwrap_or_else(|e| e.to_string()))
            }
            Command::ToolMd5(text) => Some(commands::md5_hex(&text)),
        }
    }

    fn health(&self) -> String {
        let secs = self.start_time.elapsed().as_secs();
        format!(
            "Status: ok\nUptime: {}h {}m {}s\nBots online: {}/{}",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60,
            self.bots.online_bots().len(),
            self.bots.bots().len()
        )
    }

    async fn live_status(&self, room: Option<String>) -> String {
        let Some(live) = &self.live else {
            return "Live room watching is not enabled".to_string();
        };
        let Some(room) = room.or_else(|| live.default_room.clone()) else {
            return "No live room configured".to_string();
        };
        match live.api.live_status(&room).await {
            Ok(LiveStatus::Live) => format!("Room {} is live: {}", room, room_url(&room)),
            Ok(LiveStatus::Offline) => format!("Room {} is offline", room),
            Err(e) => format!("Failed to query room {}: {}", room, e),
        }
    }

    async fn github_test(&self) -> String {
        let Some(policy) = self.github_policy.as_ref().filter(|p| !p.is_empty()) else {
            return "GitHub notifications have no targets configured".to_string();
        };
        let record = NotificationRecord::new(SourceKind::Test, TEST_NOTIFICATION);
        match self.dispatcher.dispatch(&record, policy).await {
            Ok(report) => format!(
                "Test notification sent (delivered {}, failed {})",
                report.sent, report.failed
            ),
            Err(e) => format!("Test notification failed: {}", e),
        }
    }
}
