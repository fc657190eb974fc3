//! Chat platform adapters, the bot registry and notification dispatch
//!
//! Adapters for Discord and Slack implement [`ChatBot`]; the [`Dispatcher`]
//! fans a notification out to the destinations a [`DispatchPolicy`] selects.
//!
//! [`DispatchPolicy`]: imx_core::DispatchPolicy

pub mod bus;
pub mod discord;
pub mod dispatch;
pub mod slack;

pub use bus::{AdapterError, BusSender, ChannelInfo, ChatBot, FriendInfo, GuildInfo, MessageBus};
pub use discord::DiscordBot;
pub use dispatch::{DispatchError, DispatchReport, Dispatcher};
pub use slack::SlackBot;
