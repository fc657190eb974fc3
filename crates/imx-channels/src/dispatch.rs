//! Notification fan-out
//!
//! Resolves a [`DispatchPolicy`] into concrete destinations across the online
//! bots and delivers one record to each, at most once per destination.
//! Failures are isolated per destination and only counted.

use futures_util::StreamExt;
use futures_util::stream;
use imx_core::types::{ChannelTarget, DispatchPolicy, NotificationRecord, OutgoingMessage};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{AdapterError, BusSender, ChatBot};

pub const DEFAULT_MAX_CONCURRENT_SENDS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no chat bot is online")]
    NoActiveSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DestinationKind {
    Channel,
    Private,
}

/// A resolved delivery target; `bot` indexes the online bot list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Destination {
    bot: usize,
    kind: DestinationKind,
    id: String,
}

pub struct Dispatcher {
    bots: BusSender,
    max_concurrent: usize,
}

impl Dispatcher {
    pub fn new(bots: BusSender) -> Self {
        Self {
            bots,
            max_concurrent: DEFAULT_MAX_CONCURRENT_SENDS,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn bots(&self) -> &BusSender {
        &self.bots
    }

    /// Deliver `record` to every destination `policy` resolves to
    pub async fn dispatch(
        &self,
        record: &NotificationRecord,
        policy: &DispatchPolicy,
    ) -> Result<DispatchReport, DispatchError> {
        let online = self.bots.online_bots();
        if online.is_empty() {
            warn!("Dropping {} notification: no chat bot is online", record.source());
            return Err(DispatchError::NoActiveSession);
        }

        let (destinations, unresolved) = if policy.broadcast_to_all {
            (collect_broadcast(&online, policy).await, 0)
        } else {
            resolve_explicit(&online, policy)
        };

        if destinations.is_empty() && unresolved == 0 {
            debug!("No destinations for {} notification", record.source());
            return Ok(DispatchReport::default());
        }

        let msg = OutgoingMessage::from(record);
        let results: Vec<bool> = stream::iter(destinations)
            .map(|dest| {
                let bot = online[dest.bot].clone();
                let msg = &msg;
                async move { deliver(bot.as_ref(), &dest, msg).await }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let sent = results.iter().filter(|ok| **ok).count();
        let report = DispatchReport {
            sent,
            failed: results.len() - sent + unresolved,
        };

        if report.failed > 0 {
            warn!(
                "{} notification: {} sent, {} failed",
                record.source(),
                report.sent,
                report.failed
            );
        } else {
            info!("{} notification sent to {} destination(s)", record.source(), report.sent);
        }
        Ok(report)
    }
}

async fn deliver(bot: &dyn ChatBot, dest: &Destination, msg: &OutgoingMessage) -> bool {
    let result = match dest.kind {
        DestinationKind::Channel => bot.send_message(&dest.id, msg).await,
        DestinationKind::Private => bot.send_private_message(&dest.id, msg).await,
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to deliver to {}:{}: {}", bot.platform(), dest.id, e);
            false
        }
    }
}

/// Map explicit channel ids onto online bots. Returns the destinations and
/// the number of ids no online bot could take.
fn resolve_explicit(online: &[Arc<dyn ChatBot>], policy: &DispatchPolicy) -> (Vec<Destination>, usize) {
    let mut seen = HashSet::new();
    let mut destinations = Vec::new();
    let mut unresolved = 0;

    for raw in &policy.explicit_channels {
        let target = ChannelTarget::parse(raw);
        let bot = online
            .iter()
            .position(|b| target.platform.as_deref().is_none_or(|p| b.platform() == p));
        let Some(bot) = bot else {
            warn!("No online bot can reach channel {}", raw);
            unresolved += 1;
            continue;
        };
        let dest = Destination {
            bot,
            kind: DestinationKind::Channel,
            id: target.id,
        };
        if seen.insert(dest.clone()) {
            destinations.push(dest);
        }
    }
    (destinations, unresolved)
}

/// Walk every online bot's guilds, channels and friends, applying exclusions
async fn collect_broadcast(online: &[Arc<dyn ChatBot>], policy: &DispatchPolicy) -> Vec<Destination> {
    let mut seen = HashSet::new();
    let mut destinations = Vec::new();

    for (idx, bot) in online.iter().enumerate() {
        let platform = bot.platform();
        if policy.is_platform_excluded(platform) {
            debug!("Skipping excluded platform {}", platform);
            continue;
        }

        let guilds = match bot.guild_list().await {
            Ok(guilds) => guilds,
            Err(e) => {
                warn!("Failed to list {} guilds, skipping bot: {}", platform, e);
                continue;
            }
        };

        for guild in guilds {
            if policy.is_channel_excluded(platform, &guild.id) {
                debug!("Skipping excluded guild {}:{}", platform, guild.id);
                continue;
            }
            let channels = match bot.channel_list(&guild.id).await {
                Ok(channels) => channels,
                Err(e) => {
                    debug!("Failed to list channels of {}:{}: {}", platform, guild.id, e);
                    continue;
                }
            };
            for channel in channels {
                if policy.is_channel_excluded(platform, &channel.id) {
                    continue;
                }
                let dest = Destination {
                    bot: idx,
                    kind: DestinationKind::Channel,
                    id: channel.id,
                };
                if seen.insert(dest.clone()) {
                    destinations.push(dest);
                }
            }
        }

        match bot.friend_list().await {
            Ok(friends) => {
                for friend in friends {
                    if policy.is_channel_excluded(platform, &friend.id) {
                        continue;
                    }
                    let dest = Destination {
                        bot: idx,
                        kind: DestinationKind::Private,
                        id: friend.id,
                    };
                    if seen.insert(dest.clone()) {
                        destinations.push(dest);
                    }
                }
            }
            Err(AdapterError::Unsupported(_)) => {
                debug!("{} has no friend list", platform);
            }
            Err(e) => debug!("Failed to list {} friends: {}", platform, e),
        }
    }

    destinations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelInfo, FriendInfo, GuildInfo};
    use async_trait::async_trait;
    use imx_core::types::{IncomingMessage, SourceKind};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct MockBot {
        platform: &'static str,
        online: bool,
        failing: HashSet<String>,
        guilds: Vec<GuildInfo>,
        channels: HashMap<String, Vec<ChannelInfo>>,
        broken_guilds: HashSet<String>,
        guild_list_fails: bool,
        friends: Option<Vec<FriendInfo>>,
        sent: Mutex<Vec<String>>,
        guild_calls: AtomicUsize,
    }

    impl MockBot {
        fn online(platform: &'static str) -> Self {
            Self {
                platform,
                online: true,
                ..Default::default()
            }
        }

        fn with_guild(mut self, guild: &str, channels: &[&str]) -> Self {
            self.guilds.push(GuildInfo {
                id: guild.into(),
                name: guild.into(),
            });
            self.channels.insert(
                guild.into(),
                channels
                    .iter()
                    .map(|c| ChannelInfo {
                        id: c.to_string(),
                        name: c.to_string(),
                    })
                    .collect(),
            );
            self
        }

        fn sent(&self) -> Vec<String> {
            let mut sent = self.sent.lock().unwrap().clone();
            sent.sort();
            sent
        }
    }

    #[async_trait]
    impl ChatBot for MockBot {
        fn platform(&self) -> &str {
            self.platform
        }

        fn self_id(&self) -> Option<String> {
            None
        }

        fn is_online(&self) -> bool {
            self.online
        }

        async fn start(&self, _tx: mpsc::Sender<IncomingMessage>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_message(&self, channel_id: &str, _msg: &OutgoingMessage) -> Result<(), AdapterError> {
            if self.failing.contains(channel_id) {
                return Err(AdapterError::Platform(anyhow::anyhow!("missing permissions")));
            }
            self.sent.lock().unwrap().push(format!("channel:{}", channel_id));
            Ok(())
        }

        async fn send_private_message(&self, user_id: &str, _msg: &OutgoingMessage) -> Result<(), AdapterError> {
            self.sent.lock().unwrap().push(format!("user:{}", user_id));
            Ok(())
        }

        async fn guild_list(&self) -> Result<Vec<GuildInfo>, AdapterError> {
            self.guild_calls.fetch_add(1, Ordering::SeqCst);
            if self.guild_list_fails {
                return Err(AdapterError::Offline);
            }
            Ok(self.guilds.clone())
        }

        async fn channel_list(&self, guild_id: &str) -> Result<Vec<ChannelInfo>, AdapterError> {
            if self.broken_guilds.contains(guild_id) {
                return Err(AdapterError::Platform(anyhow::anyhow!("forbidden")));
            }
            Ok(self.channels.get(guild_id).cloned().unwrap_or_default())
        }

        async fn friend_list(&self) -> Result<Vec<FriendInfo>, AdapterError> {
            self.friends
                .clone()
                .ok_or(AdapterError::Unsupported("friend list"))
        }
    }

    fn record() -> NotificationRecord {
        NotificationRecord::new(SourceKind::Test, "hello")
    }

    fn dispatcher(bots: Vec<Arc<MockBot>>) -> Dispatcher {
        Dispatcher::new(BusSender::new(
            bots.into_iter().map(|b| b as Arc<dyn ChatBot>).collect(),
        ))
    }

    #[tokio::test]
    async fn test_explicit_isolates_failures() {
        let mut bot = MockBot::online("discord");
        bot.failing.insert("B".into());
        let bot = Arc::new(bot);
        let dispatcher = dispatcher(vec![bot.clone()]);

        let report = dispatcher
            .dispatch(&record(), &DispatchPolicy::explicit(["A", "B", "C"]))
            .await
            .unwrap();

        assert_eq!(report, DispatchReport { sent: 2, failed: 1 });
        assert_eq!(bot.sent(), vec!["channel:A", "channel:C"]);
    }

    #[tokio::test]
    async fn test_explicit_qualified_routing() {
        let discord = Arc::new(MockBot::online("discord"));
        let slack = Arc::new(MockBot::online("slack"));
        let dispatcher = dispatcher(vec![discord.clone(), slack.clone()]);

        let policy = DispatchPolicy::explicit(["slack:C1", "123", "qq:9"]);
        let report = dispatcher.dispatch(&record(), &policy).await.unwrap();

        assert_eq!(report, DispatchReport { sent: 2, failed: 1 });
        assert_eq!(discord.sent(), vec!["channel:123"]);
        assert_eq!(slack.sent(), vec!["channel:C1"]);
    }

    #[tokio::test]
    async fn test_explicit_deduplicates_equivalent_ids() {
        let bot = Arc::new(MockBot::online("discord"));
        let dispatcher = dispatcher(vec![bot.clone()]);

        let policy = DispatchPolicy::explicit(["42", "discord:42"]);
        let report = dispatcher.dispatch(&record(), &policy).await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(bot.sent(), vec!["channel:42"]);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_platform() {
        let discord = Arc::new(MockBot::online("discord").with_guild("g1", &["c1", "c2"]));
        let qq = Arc::new(MockBot::online("qq").with_guild("g9", &["c9"]));
        let dispatcher = dispatcher(vec![discord.clone(), qq.clone()]);

        let policy = DispatchPolicy::broadcast().excluding_platforms(["qq"]);
        let report = dispatcher.dispatch(&record(), &policy).await.unwrap();

        assert_eq!(report, DispatchReport { sent: 2, failed: 0 });
        assert_eq!(qq.guild_calls.load(Ordering::SeqCst), 0);
        assert!(qq.sent().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_applies_exclusions_and_friends() {
        let mut bot = MockBot::online("discord")
            .with_guild("g1", &["c1", "c2"])
            .with_guild("g2", &["c3"])
            .with_guild("g3", &["c4"]);
        bot.broken_guilds.insert("g3".into());
        bot.friends = Some(vec![
            FriendInfo {
                id: "u1".into(),
                name: "alice".into(),
            },
            FriendInfo {
                id: "u2".into(),
                name: "bob".into(),
            },
        ]);
        let bot = Arc::new(bot);
        let dispatcher = dispatcher(vec![bot.clone()]);

        let policy = DispatchPolicy::broadcast().excluding_channels(["discord:c2", "g2", "u2"]);
        let report = dispatcher.dispatch(&record(), &policy).await.unwrap();

        assert_eq!(report, DispatchReport { sent: 2, failed: 0 });
        assert_eq!(bot.sent(), vec!["channel:c1", "user:u1"]);
    }

    #[tokio::test]
    async fn test_broadcast_skips_bot_when_guild_list_fails() {
        let mut broken = MockBot::online("slack");
        broken.guild_list_fails = true;
        let broken = Arc::new(broken);
        let healthy = Arc::new(MockBot::online("discord").with_guild("g1", &["c1"]));
        let dispatcher = dispatcher(vec![broken.clone(), healthy.clone()]);

        let report = dispatcher
            .dispatch(&record(), &DispatchPolicy::broadcast())
            .await
            .unwrap();

        assert_eq!(report.sent, 1);
        assert!(broken.sent().is_empty());
    }

    #[tokio::test]
    async fn test_no_online_bot() {
        let mut offline = MockBot::online("discord");
        offline.online = false;
        let dispatcher = dispatcher(vec![Arc::new(offline)]);

        let result = dispatcher
            .dispatch(&record(), &DispatchPolicy::explicit(["1"]))
            .await;
        assert_eq!(result, Err(DispatchError::NoActiveSession));
    }

    #[tokio::test]
    async fn test_empty_policy_is_noop() {
        let bot = Arc::new(MockBot::online("discord"));
        let dispatcher = dispatcher(vec![bot.clone()]);
        let report = dispatcher
            .dispatch(&record(), &DispatchPolicy::default())
            .await
            .unwrap();
        assert_eq!(report, DispatchReport::default());
        assert!(bot.sent().is_empty());
    }
}
