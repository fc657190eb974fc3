//! Shared types for imx-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Opaque chat destination id, optionally qualified as `platform:id`
pub type ChannelId = String;

/// Chat platform name as reported by an adapter (e.g. "discord", "slack")
pub type PlatformId = String;

/// Incoming chat message from any adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: String,
    pub platform: PlatformId,
    pub channel_id: String,
    pub user_id: String,
    pub sender: String,
    pub content: String,
    /// True for direct/private conversations
    #[serde(default)]
    pub private: bool,
    pub timestamp: DateTime<Utc>,
}

impl IncomingMessage {
    /// Composite key used to scope per-conversation state
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.platform, self.channel_id)
    }
}

/// Outgoing chat message, rendered by each adapter in its native format
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Ping everyone in the destination (ignored for private conversations)
    #[serde(default)]
    pub mention_all: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

impl From<&NotificationRecord> for OutgoingMessage {
    fn from(record: &NotificationRecord) -> Self {
        Self {
            content: record.text.clone(),
            attachments: record.attachments.clone(),
            mention_all: record.mention_all,
            reply_to: None,
        }
    }
}

/// Which external event produced a notification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Push,
    Issue,
    PullRequest,
    PostCreate,
    PostUpdate,
    NoteCreate,
    Comment,
    LinkApply,
    Say,
    Recently,
    ActivityLike,
    LiveStart,
    Greeting,
    Test,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Push => "push",
            Self::Issue => "issue",
            Self::PullRequest => "pull_request",
            Self::PostCreate => "post_create",
            Self::PostUpdate => "post_update",
            Self::NoteCreate => "note_create",
            Self::Comment => "comment",
            Self::LinkApply => "link_apply",
            Self::Say => "say",
            Self::Recently => "recently",
            Self::ActivityLike => "activity_like",
            Self::LiveStart => "live_start",
            Self::Greeting => "greeting",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
}

/// Media attached to a message; `locator` is a URL the adapter can fetch or embed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub locator: String,
}

impl Attachment {
    pub fn image(locator: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            locator: locator.into(),
        }
    }
}

/// A formatted notification, built once per inbound event and never mutated
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NotificationRecord {
    source: SourceKind,
    text: String,
    attachments: Vec<Attachment>,
    mention_all: bool,
}

impl NotificationRecord {
    pub fn new(source: SourceKind, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
            attachments: Vec::new(),
            mention_all: false,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_mention_all(mut self, mention_all: bool) -> Self {
        self.mention_all = mention_all;
        self
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn mention_all(&self) -> bool {
        self.mention_all
    }
}

/// Where a notification should go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub explicit_channels: BTreeSet<ChannelId>,
    pub broadcast_to_all: bool,
    pub exclude_channels: HashSet<ChannelId>,
    pub exclude_platforms: HashSet<PlatformId>,
}

impl DispatchPolicy {
    /// Deliver only to the given channels
    pub fn explicit<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ChannelId>,
    {
        Self {
            explicit_channels: channels.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Deliver to every known destination
    pub fn broadcast() -> Self {
        Self {
            broadcast_to_all: true,
            ..Default::default()
        }
    }

    pub fn excluding_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ChannelId>,
    {
        self.exclude_channels.extend(channels.into_iter().map(Into::into));
        self
    }

    pub fn excluding_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PlatformId>,
    {
        self.exclude_platforms.extend(platforms.into_iter().map(Into::into));
        self
    }

    /// True when this policy cannot reach anyone
    pub fn is_empty(&self) -> bool {
        !self.broadcast_to_all && self.explicit_channels.is_empty()
    }

    pub fn is_platform_excluded(&self, platform: &str) -> bool {
        self.exclude_platforms.contains(platform)
    }

    /// Exclusion entries match the bare id or the `platform:id` form
    pub fn is_channel_excluded(&self, platform: &str, id: &str) -> bool {
        self.exclude_channels.contains(id)
            || self.exclude_channels.contains(&format!("{}:{}", platform, id))
    }
}

/// A channel id split into its optional platform qualifier and raw id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelTarget {
    pub platform: Option<PlatformId>,
    pub id: String,
}

impl ChannelTarget {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((platform, id)) if !platform.is_empty() && !id.is_empty() => Self {
                platform: Some(platform.to_string()),
                id: id.to_string(),
            },
            _ => Self {
                platform: None,
                id: raw.to_string(),
            },
        }
    }
}

impl std::fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.platform {
            Some(p) => write!(f, "{}:{}", p, self.id),
            None => f.write_str(&self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_target_parse() {
        let qualified = ChannelTarget::parse("discord:1234");
        assert_eq!(qualified.platform.as_deref(), Some("discord"));
        assert_eq!(qualified.id, "1234");

        let bare = ChannelTarget::parse("C0123");
        assert!(bare.platform.is_none());
        assert_eq!(bare.id, "C0123");

        let dangling = ChannelTarget::parse("discord:");
        assert!(dangling.platform.is_none());
        assert_eq!(dangling.to_string(), "discord:");
    }

    #[test]
    fn test_policy_exclusions_match_both_forms() {
        let policy = DispatchPolicy::broadcast()
            .excluding_channels(["111", "slack:C9"])
            .excluding_platforms(["qq"]);

        assert!(policy.is_channel_excluded("discord", "111"));
        assert!(policy.is_channel_excluded("slack", "C9"));
        assert!(!policy.is_channel_excluded("discord", "C9"));
        assert!(policy.is_platform_excluded("qq"));
        assert!(!policy.is_empty());
    }

    #[test]
    fn test_empty_policy() {
        assert!(DispatchPolicy::default().is_empty());
        assert!(!DispatchPolicy::explicit(["1"]).is_empty());
    }

    #[test]
    fn test_record_into_outgoing() {
        let record = NotificationRecord::new(SourceKind::LiveStart, "live!")
            .with_attachment(Attachment::image("https://img/cover.jpg"))
            .with_mention_all(true);
        let msg = OutgoingMessage::from(&record);
        assert_eq!(msg.content, "live!");
        assert_eq!(msg.attachments.len(), 1);
        assert!(msg.mention_all);
    }
}
