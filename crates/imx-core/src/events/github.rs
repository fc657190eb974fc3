//! GitHub webhook events (`push`, `issues`, `pull_request`)

use serde::Deserialize;
use tracing::debug;

use super::{DecodeError, is_bot};
use crate::text::{first_line, truncate_preview};
use crate::types::{NotificationRecord, SourceKind};

/// Commits listed individually in a push notification
const MAX_LISTED_COMMITS: usize = 5;
/// Longest commit subject shown before it is cut with `...`
const COMMIT_SUBJECT_CHARS: usize = 72;

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pusher {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub commits: Vec<Commit>,
    pub pusher: Pusher,
    pub repository: Repository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuesPayload {
    pub action: String,
    pub issue: Issue,
    pub repository: Repository,
    pub sender: Account,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub html_url: String,
    #[serde(default)]
    pub merged: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestPayload {
    pub action: String,
    pub pull_request: PullRequest,
    pub repository: Repository,
    pub sender: Account,
}

/// A GitHub webhook event we know how to format
#[derive(Debug, Clone)]
pub enum GithubEvent {
    Push(PushPayload),
    Issues(IssuesPayload),
    PullRequest(PullRequestPayload),
}

impl GithubEvent {
    /// Decode a payload given the `X-GitHub-Event` header value.
    ///
    /// Returns `Ok(None)` for event names that are not handled (e.g. `ping`).
    pub fn decode(event_name: &str, body: &[u8]) -> Result<Option<Self>, DecodeError> {
        let malformed = |source| DecodeError::Malformed {
            event: event_name.to_string(),
            source,
        };
        let event = match event_name {
            "push" => Self::Push(serde_json::from_slice(body).map_err(malformed)?),
            "issues" => Self::Issues(serde_json::from_slice(body).map_err(malformed)?),
            "pull_request" => Self::PullRequest(serde_json::from_slice(body).map_err(malformed)?),
            other => {
                debug!("Ignoring unhandled GitHub event '{}'", other);
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    pub fn source_kind(&self) -> SourceKind {
        match self {
            Self::Push(_) => SourceKind::Push,
            Self::Issues(_) => SourceKind::Issue,
            Self::PullRequest(_) => SourceKind::PullRequest,
        }
    }

    /// Format the event, or `None` if it is suppressed
    pub fn normalize(&self) -> Option<NotificationRecord> {
        match self {
            Self::Push(push) => normalize_push(push),
            Self::Issues(payload) => normalize_issue(payload),
            Self::PullRequest(payload) => normalize_pull_request(payload),
        }
    }
}

fn normalize_push(push: &PushPayload) -> Option<NotificationRecord> {
    if is_bot(&push.pusher.name) {
        debug!("Suppressing push by bot {}", push.pusher.name);
        return None;
    }
    if push.commits.is_empty() {
        debug!("Suppressing push without commits to {}", push.git_ref);
        return None;
    }

    let branch = push.git_ref.trim_start_matches("refs/heads/");
    let target = if branch == "main" || branch == "master" {
        "the main branch".to_string()
    } else {
        format!("branch {}", branch)
    };

    let listed = push
        .commits
        .iter()
        .take(MAX_LISTED_COMMITS)
        .map(|c| {
            let short: String = c.id.chars().take(7).collect();
            format!(
                "• {} ({})",
                truncate_preview(first_line(&c.message), COMMIT_SUBJECT_CHARS),
                short
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let more = if push.commits.len() > MAX_LISTED_COMMITS {
        format!(
            "\n...and {} more commit(s)",
            push.commits.len() - MAX_LISTED_COMMITS
        )
    } else {
        String::new()
    };

    let text = format!(
        "📦 {repo} received a push to {target}\n\n👤 Pusher: {pusher}\n📝 {count} new commit(s):\n{listed}{more}\n\n🔗 {url}/commits/{branch}",
        repo = push.repository.full_name,
        pusher = push.pusher.name,
        count = push.commits.len(),
        url = push.repository.html_url,
    );

    Some(NotificationRecord::new(SourceKind::Push, text))
}

/// Action verb shown to readers; `merged` only applies to closed pull requests
fn action_verb(action: &str, merged: bool) -> String {
    match action {
        "opened" => "opened".to_string(),
        "closed" if merged => "merged".to_string(),
        "closed" => "closed".to_string(),
        "reopened" => "reopened".to_string(),
        other => other.replace('_', " "),
    }
}

fn normalize_issue(payload: &IssuesPayload) -> Option<NotificationRecord> {
    if is_bot(&payload.sender.login) {
        debug!("Suppressing issue event by bot {}", payload.sender.login);
        return None;
    }
    let text = format!(
        "🐛 {repo} issue update\n\n👤 {who} {verb} issue #{number}\n📝 {title}\n\n🔗 {url}",
        repo = payload.repository.full_name,
        who = payload.sender.login,
        verb = action_verb(&payload.action, false),
        number = payload.issue.number,
        title = payload.issue.title,
        url = payload.issue.html_url,
    );
    Some(NotificationRecord::new(SourceKind::Issue, text))
}

fn normalize_pull_request(payload: &PullRequestPayload) -> Option<NotificationRecord> {
    if is_bot(&payload.sender.login) {
        debug!("Suppressing pull request event by bot {}", payload.sender.login);
        return None;
    }
    let pr = &payload.pull_request;
    let text = format!(
        "🔀 {repo} pull request update\n\n👤 {who} {verb} pull request #{number}\n📝 {title}\n\n🔗 {url}",
        repo = payload.repository.full_name,
        who = payload.sender.login,
        verb = action_verb(&payload.action, pr.merged),
        number = pr.number,
        title = pr.title,
        url = pr.html_url,
    );
    Some(NotificationRecord::new(SourceKind::PullRequest, text))
}
