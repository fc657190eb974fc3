//! Tokio task runner for watchers
//!
//! Every watcher runs as its own spawned task holding a child of the runner's
//! shutdown token. Live polls run inline in the task loop, so ticks for one
//! room never overlap.

use crate::greeting::{GreetingKind, greeting_record};
use crate::live_state::{LiveStateTracker, Transition};
use crate::watcher::{Watcher, WatcherEvent, WatcherKind};
use anyhow::{Context, Result};
use chrono::Local;
use imx_core::api::{Hitokoto, HitokotoClient, LiveApi};
use imx_core::events::live::live_start_record;
use imx_core::types::NotificationRecord;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the watcher runner
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Lower bound applied to every live poll interval
    pub min_poll_interval_secs: u64,

    /// Delay before the first poll of a newly started room
    pub initial_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_secs: 30,
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// Manages the lifecycle of watcher tasks
pub struct WatcherRunner {
    config: WatcherConfig,

    event_tx: mpsc::UnboundedSender<WatcherEvent>,

    /// Active watcher tasks (watcher_id -> CancellationToken)
    active_tasks: Arc<RwLock<HashMap<String, CancellationToken>>>,

    /// Parent of every watcher token
    shutdown_token: CancellationToken,

    live_api: Option<Arc<dyn LiveApi>>,
    quotes: Option<HitokotoClient>,
    tracker: Arc<LiveStateTracker>,
}

impl WatcherRunner {
    pub fn new(event_tx: mpsc::UnboundedSender<WatcherEvent>) -> Self {
        Self::with_config(event_tx, WatcherConfig::default())
    }

    pub fn with_config(event_tx: mpsc::UnboundedSender<WatcherEvent>, config: WatcherConfig) -> Self {
        Self {
            config,
            event_tx,
            active_tasks: Arc::new(RwLock::new(HashMap::new())),
            shutdown_token: CancellationToken::new(),
            live_api: None,
            quotes: None,
            tracker: Arc::new(LiveStateTracker::new()),
        }
    }

    /// Required before any live room watcher can start
    pub fn with_live_api(mut self, api: Arc<dyn LiveApi>) -> Self {
        self.live_api = Some(api);
        self
    }

    /// Quote source for greetings; without one the fallback quote is used
    pub fn with_quotes(mut self, quotes: HitokotoClient) -> Self {
        self.quotes = Some(quotes);
        self
    }

    pub fn tracker(&self) -> Arc<LiveStateTracker> {
        self.tracker.clone()
    }

    /// Token cancelled by [`stop_all`](Self::stop_all)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    fn effective_interval(&self, interval_secs: u64) -> Duration {
        Duration::from_secs(interval_secs.max(self.config.min_poll_interval_secs))
    }

    /// Start a watcher. Starting an id that is already running is a no-op.
    pub async fn start_watcher(&self, watcher: Watcher) -> Result<()> {
        if self.active_tasks.read().await.contains_key(&watcher.id) {
            warn!("Watcher {} is already running", watcher.id);
            return Ok(());
        }

        info!("Starting watcher: {} ({})", watcher.id, watcher.description());

        let token = self.shutdown_token.child_token();

        match &watcher.kind {
            WatcherKind::LivePoll { .. } => self.spawn_live_watcher(watcher.clone(), token.clone())?,
            WatcherKind::Greeting { .. } => {
                self.spawn_greeting_watcher(watcher.clone(), token.clone())?
            }
        }

        self.active_tasks.write().await.insert(watcher.id, token);
        Ok(())
    }

    /// Stop a specific watcher
    pub async fn stop_watcher(&self, id: &str) -> bool {
        let mut tasks = self.active_tasks.write().await;

        if let Some(token) = tasks.remove(id) {
            info!("Stopping watcher: {}", id);
            token.cancel();
            true
        } else {
            warn!("Attempted to stop non-running watcher: {}", id);
            false
        }
    }

    /// Stop all watchers
    pub async fn stop_all(&self) {
        info!("Stopping all watchers");

        self.shutdown_token.cancel();

        let mut tasks = self.active_tasks.write().await;
        for (id, token) in tasks.drain() {
            debug!("Cancelling watcher: {}", id);
            token.cancel();
        }

        info!("All watchers stopped");
    }

    pub async fn active_count(&self) -> usize {
        self.active_tasks.read().await.len()
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.active_tasks.read().await.contains_key(id)
    }

    fn spawn_live_watcher(&self, watcher: Watcher, cancel_token: CancellationToken) -> Result<()> {
        let WatcherKind::LivePoll {
            room_id,
            interval_secs,
            mention_all,
        } = watcher.kind.clone()
        else {
            anyhow::bail!("watcher {} is not a live poll", watcher.id);
        };
        let api = self
            .live_api
            .clone()
            .context("No live API configured for live room watchers")?;

        let period = self.effective_interval(interval_secs);
        let start = Instant::now() + self.config.initial_delay;
        let tracker = self.tracker.clone();
        let event_tx = self.event_tx.clone();
        let active_tasks = self.active_tasks.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            debug!("Live watcher {} started with interval {:?}", watcher.id, period);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("Watcher {} cancelled", watcher.id);
                        break;
                    }
                    _ = interval.tick() => {
                        if let Some(record) = poll_room(api.as_ref(), &tracker, &room_id, mention_all).await
                            && let Err(e) = event_tx.send(WatcherEvent::new(watcher.id.clone(), record))
                        {
                            error!("Failed to send watcher event: {}", e);
                        }
                    }
                }
            }

            // Entry may already be gone if stop_watcher() removed it
            if active_tasks.write().await.remove(&watcher.id).is_some() {
                debug!("Live watcher {} cleaned up from active tasks", watcher.id);
            }
        });

        Ok(())
    }

    fn spawn_greeting_watcher(&self, watcher: Watcher, cancel_token: CancellationToken) -> Result<()> {
        let WatcherKind::Greeting { cron_expr, greeting } = watcher.kind.clone() else {
            anyhow::bail!("watcher {} is not a greeting", watcher.id);
        };

        let schedule = cron::Schedule::from_str(&cron_expr)
            .with_context(|| format!("Invalid cron expression: {}", cron_expr))?;

        let event_tx = self.event_tx.clone();
        let quotes = self.quotes.clone();
        let active_tasks = self.active_tasks.clone();

        tokio::spawn(async move {
            info!("Greeting watcher {} started: {}", watcher.id, cron_expr);

            loop {
                let now = Local::now();
                let Some(next) = schedule.after(&now).next() else {
                    error!("No next occurrence for cron expression {}", cron_expr);
                    break;
                };

                let duration = (next - now).to_std().unwrap_or(Duration::from_secs(60));
                debug!(
                    "Greeting watcher {} next run at {} (in {:?})",
                    watcher.id, next, duration
                );

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("Greeting watcher {} cancelled", watcher.id);
                        break;
                    }
                    _ = sleep_until(Instant::now() + duration) => {
                        let record = build_greeting(greeting, quotes.as_ref()).await;
                        if let Err(e) = event_tx.send(WatcherEvent::new(watcher.id.clone(), record)) {
                            error!("Failed to send watcher event: {}", e);
                        }
                    }
                }
            }

            if active_tasks.write().await.remove(&watcher.id).is_some() {
                debug!("Greeting watcher {} cleaned up from active tasks", watcher.id);
            }
        });

        Ok(())
    }
}

async fn build_greeting(kind: GreetingKind, quotes: Option<&HitokotoClient>) -> NotificationRecord {
    let quote = match quotes {
        Some(client) => client.fetch_or_fallback().await,
        None => Hitokoto::fallback(),
    };
    greeting_record(kind, &quote, &mut rand::thread_rng())
}

/// Poll one room and return the announcement when it just went live.
///
/// Anchor and room details are fetched only on the transition; when either
/// lookup fails the announcement still goes out without it.
pub async fn poll_room(
    api: &dyn LiveApi,
    tracker: &LiveStateTracker,
    room_id: &str,
    mention_all: bool,
) -> Option<NotificationRecord> {
    let status = api.live_status(room_id).await;
    if tracker.observe(room_id, status) != Transition::WentLive {
        return None;
    }

    let (anchor, room) = tokio::join!(api.anchor_info(room_id), api.room_info(room_id));
    let anchor = anchor
        .inspect_err(|e| warn!("Anchor lookup for room {} failed: {}", room_id, e))
        .ok();
    let room = room
        .inspect_err(|e| warn!("Room info lookup for room {} failed: {}", room_id, e))
        .ok();

    Some(live_start_record(room_id, anchor.as_ref(), room.as_ref(), mention_all))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use imx_core::api::{ApiError, LiveStatus};
    use imx_core::events::live::{AnchorInfo, LiveRoomInfo};
    use imx_core::types::SourceKind;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed status sequence, then reports offline
    struct ScriptedLive {
        statuses: Mutex<VecDeque<LiveStatus>>,
        polls: AtomicUsize,
        details_fail: bool,
    }

    impl ScriptedLive {
        fn new(statuses: &[LiveStatus]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                polls: AtomicUsize::new(0),
                details_fail: false,
            }
        }
    }

    #[async_trait]
    impl LiveApi for ScriptedLive {
        async fn live_status(&self, _room_id: &str) -> Result<LiveStatus, ApiError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(LiveStatus::Offline))
        }

        async fn anchor_info(&self, _room_id: &str) -> Result<AnchorInfo, ApiError> {
            if self.details_fail {
                return Err(ApiError::InvalidResponse("down".into()));
            }
            Ok(AnchorInfo {
                uid: 7,
                uname: "streamer".into(),
                face: String::new(),
            })
        }

        async fn room_info(&self, _room_id: &str) -> Result<LiveRoomInfo, ApiError> {
            if self.details_fail {
                return Err(ApiError::InvalidResponse("down".into()));
            }
            Ok(LiveRoomInfo {
                room_id: 42,
                title: "Speedrun".into(),
                cover: "https://img/cover.jpg".into(),
                area_name: "Games".into(),
                online: 100,
            })
        }
    }

    #[tokio::test]
    async fn test_poll_room_announces_once() {
        let api = ScriptedLive::new(&[LiveStatus::Offline, LiveStatus::Live, LiveStatus::Live]);
        let tracker = LiveStateTracker::new();

        assert!(poll_room(&api, &tracker, "42", false).await.is_none());
        let record = poll_room(&api, &tracker, "42", true).await.unwrap();
        assert!(poll_room(&api, &tracker, "42", false).await.is_none());

        assert_eq!(record.source(), SourceKind::LiveStart);
        assert!(record.mention_all());
        assert!(record.text().starts_with("streamer(7) is live now!"));
        assert_eq!(record.attachments().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_room_minimal_record_when_details_fail() {
        let mut api = ScriptedLive::new(&[LiveStatus::Live]);
        api.details_fail = true;
        let tracker = LiveStateTracker::new();

        let record = poll_room(&api, &tracker, "42", false).await.unwrap();
        assert_eq!(
            record.text(),
            "Room 42 is live now!\n\nRoom: https://live.bilibili.com/42"
        );
        assert!(record.attachments().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_watcher_emits_on_transition() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let api = Arc::new(ScriptedLive::new(&[LiveStatus::Offline, LiveStatus::Live]));
        let runner = WatcherRunner::new(tx).with_live_api(api.clone());

        runner
            .start_watcher(Watcher::live_room("42", 1, false))
            .await
            .unwrap();
        assert!(runner.is_running("live:42").await);

        let event = tokio::time::timeout(Duration::from_secs(300), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.watcher_id, "live:42");
        assert_eq!(event.record.source(), SourceKind::LiveStart);
        // Offline poll after the initial delay, live poll one minimum interval later
        assert_eq!(api.polls.load(Ordering::SeqCst), 2);

        runner.stop_all().await;
        assert_eq!(runner.active_count().await, 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_start_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = WatcherRunner::new(tx).with_live_api(Arc::new(ScriptedLive::new(&[])));

        runner.start_watcher(Watcher::live_room("1", 60, false)).await.unwrap();
        runner.start_watcher(Watcher::live_room("1", 60, false)).await.unwrap();
        assert_eq!(runner.active_count().await, 1);

        assert!(runner.stop_watcher("live:1").await);
        assert!(!runner.stop_watcher("live:1").await);
        runner.stop_all().await;
    }

    #[tokio::test]
    async fn test_live_watcher_requires_api() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = WatcherRunner::new(tx);
        assert!(runner.start_watcher(Watcher::live_room("1", 60, false)).await.is_err());
        assert_eq!(runner.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = WatcherRunner::new(tx);
        let result = runner
            .start_watcher(Watcher::greeting("not a cron", GreetingKind::Morning))
            .await;
        assert!(result.is_err());
        assert!(!runner.is_running("greeting:morning").await);
    }

    #[tokio::test]
    async fn test_greeting_watcher_starts() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = WatcherRunner::new(tx);
        runner
            .start_watcher(Watcher::greeting("0 0 6 * * *", GreetingKind::Morning))
            .await
            .unwrap();
        assert!(runner.is_running("greeting:morning").await);
        runner.stop_all().await;
    }

    #[test]
    fn test_minimum_interval_enforced() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = WatcherRunner::new(tx);
        assert_eq!(runner.effective_interval(1), Duration::from_secs(30));
        assert_eq!(runner.effective_interval(90), Duration::from_secs(90));
    }
}
