//! Repeat detector
//!
//! Tracks runs of identical consecutive messages per conversation. The
//! detector is deterministic; any probabilistic gating of the repeat is left
//! to the caller.

use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::debug;

/// What the caller should do after a message has been observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatAction {
    None,
    /// The run just reached the repeat threshold
    ShouldRepeat,
    /// The run went on long enough past the threshold; the window was reset
    ShouldBreak,
}

#[derive(Debug, Clone)]
pub struct RepeatConfig {
    /// Identical messages needed before repeating
    pub repeat_threshold: usize,
    /// Additional identical messages (after the threshold) before breaking the run
    pub break_threshold: usize,
    /// Upper bound on tracked conversations; least recently active ones are dropped
    pub max_sessions: usize,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            repeat_threshold: 3,
            break_threshold: 12,
            max_sessions: 1024,
        }
    }
}

#[derive(Debug)]
struct RepeatWindow {
    last: String,
    streak: usize,
}

/// Per-session sliding window over recent messages
pub struct RepeatDetector {
    repeat_threshold: usize,
    break_threshold: usize,
    windows: LruCache<String, RepeatWindow>,
}

impl RepeatDetector {
    pub fn new(config: RepeatConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_sessions.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            repeat_threshold: config.repeat_threshold.max(1),
            break_threshold: config.break_threshold.max(1),
            windows: LruCache::new(capacity),
        }
    }

    /// Record a message for a session and report whether to repeat or break
    pub fn observe(&mut self, session_key: &str, message: &str) -> RepeatAction {
        let streak = match self.windows.get_mut(session_key) {
            Some(window) if window.streak > 0 && window.last == message => {
                window.streak += 1;
                window.streak
            }
            Some(window) => {
                window.last = message.to_string();
                window.streak = 1;
                1
            }
            None => {
                self.windows.put(
                    session_key.to_string(),
                    RepeatWindow {
                        last: message.to_string(),
                        streak: 1,
                    },
                );
                1
            }
        };

        if streak == self.repeat_threshold {
            debug!("Repeat threshold reached in {}", session_key);
            return RepeatAction::ShouldRepeat;
        }

        if streak > self.repeat_threshold && streak - self.repeat_threshold == self.break_threshold {
            debug!("Breaking repeat run in {} after {} messages", session_key, streak);
            if let Some(window) = self.windows.get_mut(session_key) {
                window.last.clear();
                window.streak = 0;
            }
            return RepeatAction::ShouldBreak;
        }

        RepeatAction::None
    }

    /// Length of the current run of identical messages for a session
    pub fn streak(&self, session_key: &str) -> usize {
        self.windows.peek(session_key).map(|w| w.streak).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.windows.len()
    }
}

impl Default for RepeatDetector {
    fn default() -> Self {
        Self::new(RepeatConfig::default())
    }
}
