//! Discord History Backfill
//!
//! Archives the message history of a guild or a single channel into
//! SQLite. Runs are resumable: rerunning the same command continues from
//! the stored cursors. Ctrl-C stops new fetches, lets in-flight writes
//! finish and saves the cursors.

mod config;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backfill::{
    BackfillCoordinator, ChannelId, CursorStore, DiscordApi, DiscordHistorySource,
    DiscordMessageDisplay, Direction, DisplaySink, GuildId, JsonFileCursorStore, LogDisplay,
    RateLimitedSource, RecordId, SqliteStore, WriteDispatcher,
};
use config::AppConfig;

#[derive(Parser)]
#[command(name = "backfill")]
#[command(about = "Resumable Discord channel history backfill")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Channel of the message to edit with progress
    #[arg(long, global = true, requires = "progress_message")]
    progress_channel: Option<u64>,

    /// Message to edit with progress
    #[arg(long, global = true, requires = "progress_channel")]
    progress_message: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill every text channel of a guild, oldest message first
    Guild {
        #[arg(long)]
        guild_id: u64,
    },

    /// Backfill one channel
    Channel {
        #[arg(long)]
        channel_id: u64,

        /// forward (oldest first) or backward (newest first)
        #[arg(long, default_value = "forward")]
        direction: Direction,
    },

    /// Print the stored resume cursors
    Cursors,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,backfill=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    let store = Arc::new(
        SqliteStore::new(&config.database_url)
            .await
            .with_context(|| format!("failed to open database {}", config.database_url))?,
    );
    let cursors: Arc<dyn CursorStore> = match &config.cursor_file {
        Some(path) => Arc::new(JsonFileCursorStore::new(path)),
        None => store.clone(),
    };

    let (target, direction) = match cli.command {
        Commands::Cursors => return print_cursors(&config, &store).await,
        Commands::Guild { guild_id } => (Target::Guild(GuildId(guild_id)), Direction::Forward),
        Commands::Channel {
            channel_id,
            direction,
        } => (Target::Channel(ChannelId(channel_id)), direction),
    };

    let api = DiscordApi::new(config.discord_token.clone())
        .with_base_url(config.discord_api_base.clone());
    let source = Arc::new(RateLimitedSource::new(
        DiscordHistorySource::new(api.clone()),
        config.requests_per_second,
    ));
    let display: Arc<dyn DisplaySink> = match (cli.progress_channel, cli.progress_message) {
        (Some(channel), Some(message)) => Arc::new(DiscordMessageDisplay::new(
            api,
            ChannelId(channel),
            RecordId(message),
        )),
        _ => Arc::new(LogDisplay::new()),
    };
    let dispatcher = WriteDispatcher::builder(store.clone())
        .max_workers(config.backfill.max_workers)
        .retry(config.backfill.write_retry)
        .dead_letter(store.clone())
        .build();

    let coordinator =
        BackfillCoordinator::new(source, cursors, display, dispatcher, config.backfill.clone())
            .context("invalid backfill configuration")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing in-flight writes");
                cancel.cancel();
            }
        }
    });

    let summary = match target {
        Target::Guild(guild_id) => coordinator
            .run_guild_backfill(guild_id, &cancel)
            .await
            .context("guild backfill failed")?,
        Target::Channel(channel_id) => {
            coordinator
                .run_single_channel_backfill(channel_id, direction, &cancel)
                .await
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.failed() > 0 {
        bail!("{} channel(s) failed", summary.failed());
    }
    Ok(())
}

enum Target {
    Guild(GuildId),
    Channel(ChannelId),
}

async fn print_cursors(config: &AppConfig, store: &SqliteStore) -> Result<()> {
    let cursors = match &config.cursor_file {
        Some(path) => JsonFileCursorStore::new(path).cursors().await?,
        None => store.cursors().await?,
    };

    for cursor in cursors {
        println!("{}\t{}", cursor.key(), cursor.last_record_id);
    }
    Ok(())
}
