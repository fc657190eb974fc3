//! Per-room live state, reconciled against each poll result

use imx_core::api::{ApiError, LiveStatus};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Last known state of a monitored room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LiveState {
    /// Never successfully polled
    #[default]
    Unknown,
    Offline,
    Live,
}

impl From<LiveStatus> for LiveState {
    fn from(status: LiveStatus) -> Self {
        if status.is_live() { Self::Live } else { Self::Offline }
    }
}

/// What a poll result means for notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The room started streaming; announce it
    WentLive,
    /// The room stopped streaming; nothing is sent
    WentOffline,
    Unchanged,
}

/// Shared by every room task. Entries are overwritten in place and never
/// removed.
#[derive(Debug, Default)]
pub struct LiveStateTracker {
    states: Mutex<HashMap<String, LiveState>>,
}

impl LiveStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, room_id: &str) -> LiveState {
        self.states
            .lock()
            .map(|states| states.get(room_id).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Record a poll result. A failed poll leaves the stored state untouched.
    pub fn observe(&self, room_id: &str, result: Result<LiveStatus, ApiError>) -> Transition {
        let status = match result {
            Ok(status) => status,
            Err(e) => {
                warn!("Live status poll for room {} failed: {}", room_id, e);
                return Transition::Unchanged;
            }
        };

        let next = LiveState::from(status);
        let previous = {
            let Ok(mut states) = self.states.lock() else {
                warn!("Live state lock poisoned, skipping room {}", room_id);
                return Transition::Unchanged;
            };
            states.insert(room_id.to_string(), next).unwrap_or_default()
        };

        match (previous, next) {
            (LiveState::Unknown | LiveState::Offline, LiveState::Live) => {
                info!("Room {} went live", room_id);
                Transition::WentLive
            }
            (LiveState::Live, LiveState::Offline) => {
                info!("Room {} went offline", room_id);
                Transition::WentOffline
            }
            _ => {
                debug!("Room {} state unchanged ({:?})", room_id, next);
                Transition::Unchanged
            }
        }
    }
}
