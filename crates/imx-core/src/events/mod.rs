//! Event normalization
//!
//! Inbound payloads are decoded once at the boundary into closed enums
//! (`GithubEvent`, `BlogEvent`) and then formatted into a
//! `NotificationRecord`. Normalizers return `None` for events that are
//! deliberately suppressed (bots, privacy, recency) or that carry no
//! notifiable content.

pub mod blog;
pub mod github;
pub mod live;

use thiserror::Error;

pub use blog::{BlogEvent, BlogNormalizer, SiteInfo};
pub use github::GithubEvent;
pub use live::{AnchorInfo, LiveRoomInfo};

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Body is not JSON or is missing required fields for its event type
    #[error("malformed {event} payload: {source}")]
    Malformed {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing event type")]
    MissingEventType,
}

impl DecodeError {
    /// Valid JSON that does not match the expected shape, as opposed to a
    /// body that is not JSON at all
    pub fn is_structural(&self) -> bool {
        match self {
            Self::Malformed { source, .. } => source.is_data(),
            Self::MissingEventType => false,
        }
    }
}

/// Accounts whose activity never produces a notification
pub const BOT_ACCOUNTS: &[&str] = &[
    "dependabot[bot]",
    "github-actions[bot]",
    "renovate[bot]",
    "allcontributors[bot]",
    "codecov[bot]",
    "dependabot-preview[bot]",
    "snyk-bot",
    "greenkeeper[bot]",
    "sonarcloud[bot]",
    "deepsource-autofix[bot]",
    "gitpod-io[bot]",
    "mergify[bot]",
    "semantic-release-bot",
    "stale[bot]",
    "wakatime[bot]",
    "vercel[bot]",
    "netlify[bot]",
    "actions-user",
    "github-pages[bot]",
    "whitesource-bolt[bot]",
    "circleci[bot]",
    "travis[bot]",
    "appveyor[bot]",
    "azure-pipelines[bot]",
];

/// Automation accounts: the `[bot]` suffix convention or a known bot name
pub fn is_bot(username: &str) -> bool {
    username.ends_with("[bot]") || BOT_ACCOUNTS.contains(&username)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_bot() {
        assert!(is_bot("some-app[bot]"));
        assert!(is_bot("snyk-bot"));
        assert!(is_bot("actions-user"));
        assert!(!is_bot("octocat"));
        assert!(!is_bot("robot"));
    }

    #[test]
    fn test_structural_vs_syntax_errors() {
        let syntax = serde_json::from_slice::<serde_json::Value>(b"not json").unwrap_err();
        let err = DecodeError::Malformed {
            event: "push".into(),
            source: syntax,
        };
        assert!(!err.is_structural());

        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Needs {
            field: String,
        }
        let data = serde_json::from_slice::<Needs>(b"{}").unwrap_err();
        let err = DecodeError::Malformed {
            event: "push".into(),
            source: data,
        };
        assert!(err.is_structural());
        assert!(!DecodeError::MissingEventType.is_structural());
    }
}
