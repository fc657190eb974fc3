//! JSON bodies returned by the webhook endpoints

use serde::Serialize;

/// Outcome of a webhook that was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// A notification was built and handed to the dispatcher
    Delivered,
    /// Valid request with nothing to announce (unknown kind, suppressed event)
    Ignored,
}

/// 200 response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub ok: bool,
    pub status: DeliveryStatus,
    pub sent: usize,
    pub failed: usize,
}

impl WebhookAck {
    pub fn delivered(sent: usize, failed: usize) -> Self {
        Self {
            ok: true,
            status: DeliveryStatus::Delivered,
            sent,
            failed,
        }
    }

    pub fn ignored() -> Self {
        Self {
            ok: true,
            status: DeliveryStatus::Ignored,
            sent: 0,
            failed: 0,
        }
    }
}

/// Body of every non-200 response
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
        }
    }
}

/// `GET /api/status` body
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub bots_online: usize,
    pub bots_registered: usize,
    pub hooks: Vec<String>,
}
