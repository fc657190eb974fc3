use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod handler;

use config::ImxConfig;
use handler::{LiveLookup, MessageHandler, RepeatPolicy};
use imx_channels::{DiscordBot, Dispatcher, MessageBus, SlackBot};
use imx_core::api::{BilibiliClient, BlogApi, BlogClient, HitokotoClient, LiveApi};
use imx_core::{BlogNormalizer, DispatchPolicy, SiteInfo};
use imx_gateway::{BlogHook, GatewayServer, GithubHook};
use imx_scheduler::{GreetingKind, LiveState, LiveStateTracker, Watcher, WatcherRunner, poll_room};

/// Concurrent inbound messages being handled at once
const MAX_IN_FLIGHT: usize = 16;

#[derive(Parser)]
#[command(name = "imx")]
#[command(version)]
#[command(about = "imx: a chat notification bot for blog, GitHub and live room events")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot: chat adapters, webhook server and watchers
    Start,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration with secrets masked
    Config,

    /// Check once whether a live room is broadcasting
    CheckLive {
        /// Room id; defaults to the first configured room
        room: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --debug
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
        Commands::CheckLive { room } => cmd_check_live(&cli.config, room).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("imx initialized at {}", config_dir.display());
    println!("Edit {} to configure your bots and notification targets.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ImxConfig::load(config_path)?;
    println!("{:#?}", cfg);
    Ok(())
}

async fn cmd_check_live(config_path: &Option<PathBuf>, room: Option<String>) -> Result<()> {
    let cfg = ImxConfig::load(config_path)?;
    let room = room
        .or_else(|| cfg.bilibili.rooms.first().map(|r| r.room_id.clone()))
        .context("No room given and none configured under [[bilibili.rooms]]")?;

    let api = BilibiliClient::new()?;
    // A fresh tracker treats a live first poll as the went-live transition
    let tracker = LiveStateTracker::new();
    let record = poll_room(&api, &tracker, &room, false).await;
    match tracker.state(&room) {
        LiveState::Live => println!("Room {} is live", room),
        LiveState::Offline => println!("Room {} is offline", room),
        LiveState::Unknown => anyhow::bail!("Could not query room {}", room),
    }
    if let Some(record) = record {
        println!("\n{}", record.text());
    }
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ImxConfig::load(config_path)?;
    info!("Starting imx...");

    let cancel = CancellationToken::new();

    // Initialize message bus
    let mut bus = MessageBus::new(256);

    if cfg.channels.discord.enabled {
        bus.register(Arc::new(
            DiscordBot::new(cfg.channels.discord.token.clone()).with_shutdown(cancel.child_token()),
        ));
        info!("Discord bot registered");
    }

    if cfg.channels.slack.enabled {
        let slack = SlackBot::new(
            cfg.channels.slack.bot_token.clone(),
            Duration::from_secs(cfg.channels.slack.poll_interval_secs.max(1)),
        )?
        .with_shutdown(cancel.child_token());
        bus.register(Arc::new(slack));
        info!("Slack bot registered");
    }

    if bus.bot_count() == 0 {
        warn!("No chat bot is enabled; notifications will be dropped");
    }

    let started = bus.start_all().await;
    info!("{} of {} bot(s) started", started, bus.bot_count());

    let (mut incoming_rx, bus_sender) = bus.split();
    let dispatcher = Arc::new(Dispatcher::new(bus_sender));

    // Live rooms and greetings
    let live_api: Arc<dyn LiveApi> = Arc::new(BilibiliClient::new()?);
    let (watcher_event_tx, mut watcher_event_rx) = tokio::sync::mpsc::unbounded_channel();
    let watcher_runner = Arc::new(
        WatcherRunner::new(watcher_event_tx)
            .with_live_api(live_api.clone())
            .with_quotes(HitokotoClient::new()?),
    );
    let mut policies: HashMap<String, DispatchPolicy> = HashMap::new();

    if cfg.bilibili.enabled {
        let policy = cfg.bilibili.targets.policy();
        for room in &cfg.bilibili.rooms {
            let interval = room.interval_secs.unwrap_or(cfg.bilibili.interval_secs);
            let watcher = Watcher::live_room(&room.room_id, interval, room.mention_all);
            policies.insert(watcher.id.clone(), policy.clone());
            if let Err(e) = watcher_runner.start_watcher(watcher).await {
                error!("Failed to watch live room {}: {:#}", room.room_id, e);
            }
        }
    }

    if cfg.blog.enabled && cfg.blog.greeting.enabled {
        let policy = cfg.blog.targets.policy();
        for (cron, kind) in [
            (&cfg.blog.greeting.morning_cron, GreetingKind::Morning),
            (&cfg.blog.greeting.evening_cron, GreetingKind::Evening),
        ] {
            let watcher = Watcher::greeting(cron, kind);
            policies.insert(watcher.id.clone(), policy.clone());
            if let Err(e) = watcher_runner.start_watcher(watcher).await {
                error!("Failed to schedule {} greeting: {:#}", kind, e);
            }
        }
    }
    info!("{} watcher(s) running", watcher_runner.active_count().await);

    // Webhook server
    let gateway = if cfg.gateway.enabled && (cfg.github.enabled || cfg.blog.enabled) {
        let addr: SocketAddr = format!("{}:{}", cfg.gateway.bind, cfg.gateway.port)
            .parse()
            .context("Invalid gateway bind address")?;
        let mut server = GatewayServer::new(addr, dispatcher.clone()).with_body_limit(cfg.gateway.max_body_bytes);

        if cfg.github.enabled {
            server = server.with_github(GithubHook {
                path: cfg.github.webhook_path.clone(),
                secret: non_empty(&cfg.github.webhook_secret),
                policy: cfg.github.targets.policy(),
            });
        }

        if cfg.blog.enabled {
            let api: Option<Arc<dyn BlogApi>> = if cfg.blog.base_url.is_empty() {
                warn!("blog.base_url is not set; webhook payloads are used as-is");
                None
            } else {
                Some(Arc::new(BlogClient::new(
                    cfg.blog.base_url.clone(),
                    non_empty(&cfg.blog.token),
                )?))
            };
            server = server.with_blog(BlogHook {
                path: cfg.blog.webhook_path.clone(),
                secret: non_empty(&cfg.blog.webhook_secret),
                policy: cfg.blog.targets.policy(),
                normalizer: BlogNormalizer::new(cfg.blog.update_min_age_days),
                api,
                site: SiteInfo {
                    owner_name: cfg.blog.owner_name.clone(),
                    owner_username: cfg.blog.owner_name.clone(),
                    site_title: cfg.blog.site_title.clone(),
                    web_url: cfg.blog.web_url.clone(),
                },
            });
        }

        // Surface router errors (bad paths) before going into the background
        server.router()?;
        Some(server.spawn(cancel.clone()))
    } else {
        None
    };

    // Chat handler
    let mut handler = MessageHandler::new(dispatcher.clone(), cfg.tools.clone())?;
    if cfg.repeater.enabled {
        handler = handler.with_repeater(RepeatPolicy::new(&cfg.repeater));
    }
    if cfg.bilibili.enabled {
        handler = handler.with_live(LiveLookup {
            api: live_api.clone(),
            default_room: cfg.bilibili.rooms.first().map(|r| r.room_id.clone()),
        });
    }
    if cfg.github.enabled {
        handler = handler.with_github_policy(cfg.github.targets.policy());
    }
    let handler = Arc::new(handler);

    println!("imx is running. Press Ctrl+C to stop.");

    let semaphore = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
    let cancel_clone = cancel.clone();
    let main_loop = tokio::spawn(async move {
        let mut join_set = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel_clone.cancelled() => {
                    info!("Main loop shutting down");
                    break;
                }
                msg = incoming_rx.recv() => {
                    let Some(incoming) = msg else {
                        info!("Message bus closed");
                        break;
                    };
                    info!("Message from {} in {}: {}",
                        incoming.sender,
                        incoming.session_key(),
                        truncate(&incoming.content, 100));
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let handler = handler.clone();
                    join_set.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handler.handle(incoming).await {
                            error!("Failed to answer message: {}", e);
                        }
                    });
                }
                event = watcher_event_rx.recv() => {
                    let Some(event) = event else { continue };
                    let Some(policy) = policies.get(&event.watcher_id).cloned() else {
                        warn!("Event from unknown watcher {}", event.watcher_id);
                        continue;
                    };
                    info!("Watcher event from {}: {}", event.watcher_id, event.record.source());
                    let dispatcher = dispatcher.clone();
                    join_set.spawn(async move {
                        if let Err(e) = dispatcher.dispatch(&event.record, &policy).await {
                            warn!("Watcher {} notification dropped: {}", event.watcher_id, e);
                        }
                    });
                }
                Some(_) = join_set.join_next(), if !join_set.is_empty() => {}
            }
        }

        // Drain remaining tasks for graceful shutdown
        while join_set.join_next().await.is_some() {}
    });

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    watcher_runner.stop_all().await;

    if let Err(e) = main_loop.await {
        error!("Main loop panicked: {}", e);
    }

    if let Some(gateway) = gateway {
        match gateway.await {
            Ok(Err(e)) => error!("Webhook server error: {:#}", e),
            Err(e) => error!("Webhook server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    println!("imx stopped.");
    Ok(())
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
