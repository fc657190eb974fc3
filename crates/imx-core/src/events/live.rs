//! Live room notifications

use serde::Deserialize;

use crate::types::{Attachment, NotificationRecord, SourceKind};

/// Streamer behind a live room
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AnchorInfo {
    pub uid: u64,
    pub uname: String,
    #[serde(default)]
    pub face: String,
}

/// Room details shown in the went-live announcement
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LiveRoomInfo {
    pub room_id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub area_name: String,
    #[serde(default)]
    pub online: u64,
}

pub fn room_url(room_id: &str) -> String {
    format!("https://live.bilibili.com/{}", room_id)
}

/// Build the went-live notification. Anchor and room details are optional so
/// a minimal announcement can still go out when those lookups fail.
pub fn live_start_record(
    room_id: &str,
    anchor: Option<&AnchorInfo>,
    room: Option<&LiveRoomInfo>,
    mention_all: bool,
) -> NotificationRecord {
    let mut text = match anchor {
        Some(a) => format!("{}({}) is live now!\n\n", a.uname, a.uid),
        None => format!("Room {} is live now!\n\n", room_id),
    };

    if let Some(room) = room {
        if !room.title.is_empty() {
            text.push_str(&format!("Title: {}\n", room.title));
        }
        if !room.area_name.is_empty() {
            text.push_str(&format!("Area: {}\n", room.area_name));
        }
        if room.online > 0 {
            text.push_str(&format!("Watching: {}\n", room.online));
        }
    }
    text.push_str(&format!("Room: {}", room_url(room_id)));

    let record = NotificationRecord::new(SourceKind::LiveStart, text).with_mention_all(mention_all);
    match room.filter(|r| !r.cover.is_empty()) {
        Some(r) => record.with_attachment(Attachment::image(r.cover.clone())),
        None => record,
    }
}
