use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use feedrelay::config::Config;
use feedrelay::dispatch::{
    DiscordDestination, Dispatcher, NoticeKind, SubscriptionNotice, TelegramDestination,
    WebhookDestination,
};
use feedrelay::feed::{FeedCycle, Fetcher};
use feedrelay::scheduler::Scheduler;
use feedrelay::storage::{Database, DatabaseError};
use feedrelay::translate::{provider_from_config, TranslationCache};

const USER_AGENT: &str = concat!("feedrelay/", env!("CARGO_PKG_VERSION"));

/// Get the config directory path (~/.config/feedrelay/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedrelay"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedrelay",
    about = "Polls feeds and relays new entries to Telegram, Discord and webhooks"
)]
struct Args {
    /// Config file (default: ~/.config/feedrelay/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overrides `database_path` from the config
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Run a single polling cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedrelay=info")),
        )
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    ensure_private_dir(&config_dir)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args
        .db
        .clone()
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("feedrelay.db"));
    let db = open_database(&db_path).await?;

    let (notice_tx, notice_rx) = mpsc::channel(64);
    tokio::spawn(log_notices(notice_rx));

    let dispatcher = build_dispatcher(&db, &config, notice_tx)?;
    if dispatcher.platforms().next().is_none() {
        tracing::warn!("No destinations configured, new entries will only be stored");
    }

    let fetcher =
        Fetcher::new(db.clone(), config.fetcher.clone()).context("Failed to build feed fetcher")?;
    let scheduler = Arc::new(Scheduler::new(
        FeedCycle::new(db.clone(), fetcher, dispatcher),
        config.scheduler.clone(),
    ));

    if args.once {
        let reports = scheduler.run_once().await;
        let new_entries: usize = reports.iter().map(|r| r.new_entries).sum();
        let delivered: usize = reports.iter().map(|r| r.dispatch.delivered).sum();
        tracing::info!(
            feeds = reports.len(),
            new_entries = new_entries,
            delivered = delivered,
            "Single cycle complete"
        );
        db.close().await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let cleaner = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown_rx.clone();
        let interval = config.scheduler.cleanup_interval();
        let retention = config.scheduler.retention();
        tokio::spawn(async move {
            scheduler
                .run_cleanup_forever(interval, retention, shutdown)
                .await
        })
    };

    scheduler
        .run_forever(
            config.scheduler.interval(),
            config.scheduler.concurrency_limit,
            shutdown_rx,
        )
        .await;

    if let Err(e) = cleaner.await {
        tracing::warn!(error = %e, "Cleanup task ended abnormally");
    }
    db.close().await;
    Ok(())
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).context("Failed to create config directory")?;
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(dir, perms) {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }
    Ok(())
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of feedrelay appears to be using {}. Stop it and try again.",
                path.display()
            );
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

fn build_dispatcher(
    db: &Database,
    config: &Config,
    notices: mpsc::Sender<SubscriptionNotice>,
) -> Result<Dispatcher> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let mut dispatcher = Dispatcher::new(db.clone(), config.dispatch.clone()).with_notices(notices);

    if let Some(token) = &config.telegram.bot_token {
        dispatcher = dispatcher.with_destination(
            Arc::new(TelegramDestination::new(
                client.clone(),
                SecretString::from(token.clone()),
                &config.telegram.api_url,
            )),
            config.telegram.rate,
        );
    }

    if let Some(token) = &config.discord.bot_token {
        dispatcher = dispatcher.with_destination(
            Arc::new(DiscordDestination::new(
                client.clone(),
                SecretString::from(token.clone()),
                &config.discord.api_url,
            )),
            config.discord.rate,
        );
    }

    if config.webhook.enabled {
        // Redirects could walk a validated public URL onto a private address.
        let webhook_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build webhook HTTP client")?;
        dispatcher = dispatcher.with_destination(
            Arc::new(WebhookDestination::new(
                webhook_client,
                config.webhook.allow_private_networks,
            )),
            config.webhook.rate,
        );
    }

    if config.translation.enabled {
        let provider = provider_from_config(&config.translation)
            .context("Failed to configure translation provider")?;
        tracing::info!(provider = provider.name(), "Translation enabled");
        dispatcher = dispatcher.with_translator(TranslationCache::new(
            db.clone(),
            provider,
            config.translation.cache_capacity,
            config.translation.cache_max_age(),
        ));
    }

    Ok(dispatcher)
}

/// Surface subscription state changes. Chat-side replies to subscribers
/// belong to the command surface, which consumes the same notices.
async fn log_notices(mut rx: mpsc::Receiver<SubscriptionNotice>) {
    while let Some(notice) = rx.recv().await {
        match &notice.kind {
            NoticeKind::Disabled { reason } => tracing::info!(
                subscription_id = notice.subscription_id,
                platform = %notice.platform,
                channel = %notice.channel_id,
                reason = %reason,
                "Subscription disabled"
            ),
            NoticeKind::TranslationDisabled { language } => tracing::info!(
                subscription_id = notice.subscription_id,
                platform = %notice.platform,
                channel = %notice.channel_id,
                language = %language,
                "Translation disabled for subscription"
            ),
        }
    }
}
