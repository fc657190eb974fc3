use anyhow::{Context, Result};
use imx_core::DispatchPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImxConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub blog: BlogConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub bilibili: BilibiliConfig,
    #[serde(default)]
    pub repeater: RepeaterConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Where a notifying section delivers. Flattened into each section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyTargets {
    /// Channel ids, bare (`1234`) or platform-qualified (`discord:1234`)
    #[serde(default)]
    pub watch_channels: Vec<String>,
    /// Send to every channel and friend of every online bot instead
    #[serde(default)]
    pub broadcast_to_all: bool,
    #[serde(default)]
    pub exclude_channels: Vec<String>,
    #[serde(default)]
    pub exclude_platforms: Vec<String>,
}

impl NotifyTargets {
    pub fn policy(&self) -> DispatchPolicy {
        let base = if self.broadcast_to_all {
            DispatchPolicy::broadcast()
        } else {
            DispatchPolicy::explicit(self.watch_channels.iter().cloned())
        };
        base.excluding_channels(self.exclude_channels.iter().cloned())
            .excluding_platforms(self.exclude_platforms.iter().cloned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    3000
}

fn default_max_body_bytes() -> usize {
    imx_gateway::server::DEFAULT_MAX_BODY_BYTES
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_gateway_bind(),
            port: default_gateway_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub slack: SlackConfig,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("enabled", &self.enabled)
            .field("token", &mask_secret(&self.token))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_slack_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_slack_poll_interval() -> u64 {
    3
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            poll_interval_secs: default_slack_poll_interval(),
        }
    }
}

impl std::fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackConfig")
            .field("enabled", &self.enabled)
            .field("bot_token", &mask_secret(&self.bot_token))
            .field("poll_interval_secs", &self.poll_interval_secs)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BlogConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Blog API base, e.g. `https://api.example.com/api/v2`
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_blog_path")]
    pub webhook_path: String,
    #[serde(default)]
    pub webhook_secret: String,
    /// Post updates are announced only for posts older than this
    #[serde(default = "default_update_min_age_days")]
    pub update_min_age_days: i64,
    /// Site details used when the aggregate endpoint is unavailable
    #[serde(default)]
    pub owner_name: String,
    #[serde(default)]
    pub site_title: String,
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub greeting: GreetingConfig,
    #[serde(flatten)]
    pub targets: NotifyTargets,
}

fn default_blog_path() -> String {
    imx_gateway::server::DEFAULT_BLOG_PATH.to_string()
}

fn default_update_min_age_days() -> i64 {
    90
}

impl Default for BlogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            token: String::new(),
            webhook_path: default_blog_path(),
            webhook_secret: String::new(),
            update_min_age_days: default_update_min_age_days(),
            owner_name: String::new(),
            site_title: String::new(),
            web_url: String::new(),
            greeting: GreetingConfig::default(),
            targets: NotifyTargets::default(),
        }
    }
}

impl std::fmt::Debug for BlogConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlogConfig")
            .field("enabled", &self.enabled)
            .field("base_url", &self.base_url)
            .field("token", &mask_secret(&self.token))
            .field("webhook_path", &self.webhook_path)
            .field("webhook_secret", &mask_secret(&self.webhook_secret))
            .field("update_min_age_days", &self.update_min_age_days)
            .field("owner_name", &self.owner_name)
            .field("site_title", &self.site_title)
            .field("web_url", &self.web_url)
            .field("greeting", &self.greeting)
            .field("targets", &self.targets)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_morning_cron")]
    pub morning_cron: String,
    #[serde(default = "default_evening_cron")]
    pub evening_cron: String,
}

fn default_morning_cron() -> String {
    imx_scheduler::DEFAULT_MORNING_CRON.to_string()
}

fn default_evening_cron() -> String {
    imx_scheduler::DEFAULT_EVENING_CRON.to_string()
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            morning_cron: default_morning_cron(),
            evening_cron: default_evening_cron(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_github_path")]
    pub webhook_path: String,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(flatten)]
    pub targets: NotifyTargets,
}

fn default_github_path() -> String {
    imx_gateway::server::DEFAULT_GITHUB_PATH.to_string()
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_path: default_github_path(),
            webhook_secret: String::new(),
            targets: NotifyTargets::default(),
        }
    }
}

impl std::fmt::Debug for GithubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubConfig")
            .field("enabled", &self.enabled)
            .field("webhook_path", &self.webhook_path)
            .field("webhook_secret", &mask_secret(&self.webhook_secret))
            .field("targets", &self.targets)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BilibiliConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Poll interval for rooms that do not set their own (minimum 30)
    #[serde(default = "default_live_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub rooms: Vec<LiveRoomConfig>,
    #[serde(flatten)]
    pub targets: NotifyTargets,
}

fn default_live_interval() -> u64 {
    60
}

impl Default for BilibiliConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_live_interval(),
            rooms: Vec::new(),
            targets: NotifyTargets::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveRoomConfig {
    pub room_id: String,
    /// Ping everyone when the room goes live
    #[serde(default)]
    pub mention_all: bool,
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeaterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: usize,
    #[serde(default = "default_break_threshold")]
    pub break_threshold: usize,
    /// Chance of actually repeating once the threshold is reached
    #[serde(default = "default_repeat_probability")]
    pub probability: f64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_break_message")]
    pub break_message: String,
}

fn default_repeat_threshold() -> usize {
    3
}
fn default_break_threshold() -> usize {
    12
}
fn default_repeat_probability() -> f64 {
    0.5
}
fn default_max_sessions() -> usize {
    1024
}
fn default_break_message() -> String {
    "Repeat chain broken!".to_string()
}

impl Default for RepeaterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repeat_threshold: default_repeat_threshold(),
            break_threshold: default_break_threshold(),
            probability: default_repeat_probability(),
            max_sessions: default_max_sessions(),
            break_message: default_break_message(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
}

fn default_command_prefix() -> String {
    "/".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command_prefix: default_command_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".imx")
}

impl ImxConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        // Refuse group/world readable files; they may hold tokens
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `imx init` first.",
                path.display()
            )
        })?;

        let expanded = expand_env_vars(&content);

        let config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        warn_hardcoded("Discord token", &config.channels.discord.token, "DISCORD_BOT_TOKEN");
        warn_hardcoded("Slack bot token", &config.channels.slack.bot_token, "SLACK_BOT_TOKEN");
        warn_hardcoded("Blog API token", &config.blog.token, "IMX_BLOG_TOKEN");

        if !(0.0..=1.0).contains(&config.repeater.probability) {
            anyhow::bail!(
                "repeater.probability must be between 0 and 1 (got {})",
                config.repeater.probability
            );
        }

        Ok(config)
    }
}

fn warn_hardcoded(what: &str, value: &str, env_var: &str) {
    if !value.is_empty() && !value.contains("${") {
        warn!(
            "{} is hardcoded in config file. For security, use environment variables: \"${{{}}}\"",
            what, env_var
        );
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "DISCORD_BOT_TOKEN",
    "SLACK_BOT_TOKEN",
    "IMX_BLOG_TOKEN",
    "IMX_BLOG_WEBHOOK_SECRET",
    "IMX_GITHUB_WEBHOOK_SECRET",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len;
    }
    result
}
