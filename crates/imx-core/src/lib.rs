//! imx core: event normalization, repeat detection and external API clients

pub mod api;
pub mod commands;
pub mod events;
pub mod repeater;
pub mod text;
pub mod types;

pub use events::{BlogEvent, BlogNormalizer, DecodeError, GithubEvent, SiteInfo};
pub use repeater::{RepeatAction, RepeatConfig, RepeatDetector};
pub use types::{
    Attachment, AttachmentKind, ChannelId, ChannelTarget, DispatchPolicy, IncomingMessage,
    NotificationRecord, OutgoingMessage, PlatformId, SourceKind,
};
