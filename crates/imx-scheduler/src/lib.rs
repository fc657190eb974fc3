//! Periodic tasks: live room polling and scheduled greetings

pub mod greeting;
pub mod live_state;
pub mod runner;
pub mod watcher;

pub use greeting::{DEFAULT_EVENING_CRON, DEFAULT_MORNING_CRON, GreetingKind, greeting_record};
pub use live_state::{LiveState, LiveStateTracker, Transition};
pub use runner::{WatcherConfig, WatcherRunner, poll_room};
pub use watcher::{Watcher, WatcherEvent, WatcherKind};
