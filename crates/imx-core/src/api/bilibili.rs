//! Bilibili live room API

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{ApiError, build_client, check_status};
use crate::events::live::{AnchorInfo, LiveRoomInfo};

pub const DEFAULT_BASE_URL: &str = "https://api.live.bilibili.com";
const REFERER: &str = "https://www.bilibili.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether a room is broadcasting right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStatus {
    Live,
    Offline,
}

impl LiveStatus {
    pub fn is_live(self) -> bool {
        self == Self::Live
    }
}

#[async_trait]
pub trait LiveApi: Send + Sync {
    async fn live_status(&self, room_id: &str) -> Result<LiveStatus, ApiError>;
    async fn anchor_info(&self, room_id: &str) -> Result<AnchorInfo, ApiError>;
    async fn room_info(&self, room_id: &str) -> Result<LiveRoomInfo, ApiError>;
}

/// Standard `{code, message, data}` response wrapper
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct PlayInfo {
    live_status: i64,
    #[serde(default)]
    playurl_info: Option<Value>,
}

impl PlayInfo {
    /// Live only when the room reports status 1 and actually serves a stream
    fn status(&self) -> LiveStatus {
        let has_stream = self.playurl_info.as_ref().is_some_and(|v| !v.is_null());
        if self.live_status == 1 && has_stream {
            LiveStatus::Live
        } else {
            LiveStatus::Offline
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnchorData {
    info: AnchorInfo,
}

#[derive(Debug, Deserialize)]
struct RoomBaseData {
    #[serde(default)]
    by_room_ids: HashMap<String, LiveRoomInfo>,
}

#[derive(Debug, Clone)]
pub struct BilibiliClient {
    client: Client,
    base_url: String,
}

impl BilibiliClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_client(REQUEST_TIMEOUT)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {} {:?}", url, query);
        let response = self
            .client
            .get(&url)
            .query(query)
            .header("referer", REFERER)
            .send()
            .await?;
        let envelope: Envelope<T> = check_status(response)?.json().await?;
        if envelope.code != 0 {
            return Err(ApiError::Remote {
                code: envelope.code,
                message: envelope.message,
            });
        }
        envelope
            .data
            .ok_or_else(|| ApiError::InvalidResponse(format!("{} returned no data", path)))
    }
}

#[async_trait]
impl LiveApi for BilibiliClient {
    async fn live_status(&self, room_id: &str) -> Result<LiveStatus, ApiError> {
        let info: PlayInfo = self
            .get(
                "/xlive/web-room/v2/index/getRoomPlayInfo",
                &[
                    ("room_id", room_id),
                    ("protocol", "0,1"),
                    ("format", "0,1,2"),
                    ("codec", "0,1"),
                    ("qn", "0"),
                    ("platform", "web"),
                    ("ptype", "8"),
                    ("dolby", "5"),
                ],
            )
            .await?;
        Ok(info.status())
    }

    async fn anchor_info(&self, room_id: &str) -> Result<AnchorInfo, ApiError> {
        let data: AnchorData = self
            .get(
                "/live_user/v1/UserInfo/get_anchor_in_room",
                &[("roomid", room_id)],
            )
            .await?;
        Ok(data.info)
    }

    async fn room_info(&self, room_id: &str) -> Result<LiveRoomInfo, ApiError> {
        let mut data: RoomBaseData = self
            .get(
                "/xlive/web-room/v1/index/getRoomBaseInfo",
                &[("room_ids", room_id), ("req_biz", "link-center")],
            )
            .await?;
        data.by_room_ids
            .remove(room_id)
            .ok_or_else(|| ApiError::InvalidResponse(format!("room {} not in response", room_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_play_info(server: &MockServer, data: Value) {
        Mock::given(method("GET"))
            .and(path("/xlive/web-room/v2/index/getRoomPlayInfo"))
            .and(query_param("room_id", "1234"))
            .and(header("referer", REFERER))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"code": 0, "message": "0", "data": data})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_live_requires_play_url() {
        let server = MockServer::start().await;
        mount_play_info(&server, json!({"live_status": 1, "playurl_info": {"playurl": {}}})).await;
        let client = BilibiliClient::with_base_url(server.uri()).unwrap();
        assert_eq!(client.live_status("1234").await.unwrap(), LiveStatus::Live);
    }

    #[tokio::test]
    async fn test_status_one_without_stream_is_offline() {
        let server = MockServer::start().await;
        mount_play_info(&server, json!({"live_status": 1, "playurl_info": null})).await;
        let client = BilibiliClient::with_base_url(server.uri()).unwrap();
        assert_eq!(client.live_status("1234").await.unwrap(), LiveStatus::Offline);
    }

    #[tokio::test]
    async fn test_remote_error_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xlive/web-room/v2/index/getRoomPlayInfo"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"code": 19002000, "message": "room not found", "data": null})),
            )
            .mount(&server)
            .await;
        let client = BilibiliClient::with_base_url(server.uri()).unwrap();
        let err = client.live_status("1234").await.unwrap_err();
        assert!(matches!(err, ApiError::Remote { code: 19002000, .. }));
    }

    #[tokio::test]
    async fn test_anchor_and_room_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/live_user/v1/UserInfo/get_anchor_in_room"))
            .and(query_param("roomid", "1234"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"info": {"uid": 42, "uname": "streamer", "face": "f.jpg", "gender": 0}},
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xlive/web-room/v1/index/getRoomBaseInfo"))
            .and(query_param("room_ids", "1234"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"by_room_ids": {"1234": {
                    "room_id": 1234,
                    "uid": 42,
                    "title": "Coding",
                    "cover": "https://i0.hdslb.com/c.jpg",
                    "live_status": 1,
                    "area_name": "Tech",
                }}},
            })))
            .mount(&server)
            .await;

        let client = BilibiliClient::with_base_url(server.uri()).unwrap();
        let anchor = client.anchor_info("1234").await.unwrap();
        assert_eq!(anchor.uname, "streamer");
        let room = client.room_info("1234").await.unwrap();
        assert_eq!(room.title, "Coding");
        assert_eq!(room.cover, "https://i0.hdslb.com/c.jpg");
    }
}
