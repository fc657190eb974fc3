//! Watcher types and definitions
//!
//! A watcher is a periodic task owned by the runner: either a live room poll
//! or a cron-scheduled greeting. Triggered watchers emit a [`WatcherEvent`]
//! carrying a ready-to-dispatch notification.

use chrono::{DateTime, Utc};
use imx_core::types::NotificationRecord;

use crate::greeting::GreetingKind;

/// A periodic task monitored by the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watcher {
    /// Stable identifier; the caller maps it back to a dispatch policy
    pub id: String,

    pub kind: WatcherKind,
}

impl Watcher {
    /// Poll one live room
    pub fn live_room(room_id: impl Into<String>, interval_secs: u64, mention_all: bool) -> Self {
        let room_id = room_id.into();
        Self {
            id: format!("live:{}", room_id),
            kind: WatcherKind::LivePoll {
                room_id,
                interval_secs,
                mention_all,
            },
        }
    }

    /// Send a greeting on a cron schedule
    pub fn greeting(cron_expr: impl Into<String>, greeting: GreetingKind) -> Self {
        Self {
            id: format!("greeting:{}", greeting),
            kind: WatcherKind::Greeting {
                cron_expr: cron_expr.into(),
                greeting,
            },
        }
    }

    /// Get a human-readable description of this watcher
    pub fn description(&self) -> String {
        match &self.kind {
            WatcherKind::LivePoll {
                room_id,
                interval_secs,
                mention_all,
            } => {
                let mut desc = format!("Live room {} (every {}s)", room_id, interval_secs);
                if *mention_all {
                    desc.push_str(", mentions everyone");
                }
                desc
            }
            WatcherKind::Greeting { cron_expr, greeting } => {
                format!("{} greeting (cron: {})", greeting, cron_expr)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherKind {
    /// Poll a live room and announce when it starts streaming
    LivePoll {
        room_id: String,

        /// Raised to the runner's minimum when lower
        interval_secs: u64,

        /// Ping everyone in the destination channels
        mention_all: bool,
    },

    /// Send a greeting on a schedule (six-field cron, seconds first)
    Greeting {
        cron_expr: String,
        greeting: GreetingKind,
    },
}

impl WatcherKind {
    pub fn is_polling(&self) -> bool {
        matches!(self, Self::LivePoll { .. })
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Greeting { .. })
    }
}

/// Emitted by a watcher when it has something to announce
#[derive(Debug, Clone)]
pub struct WatcherEvent {
    pub watcher_id: String,
    pub record: NotificationRecord,
    pub timestamp: DateTime<Utc>,
}

impl WatcherEvent {
    pub fn new(watcher_id: String, record: NotificationRecord) -> Self {
        Self {
            watcher_id,
            record,
            timestamp: Utc::now(),
        }
    }
}
