//! Command-line interface for tubecache.
//!
//! Provides commands for resolving content, inspecting and resetting
//! stored records, reading the event log, and showing configuration.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::{ArchiveSearch, OriginFetchService, TelegramArchive, YtDlpOrigin};
use crate::config::{self, paths, ResolvedConfig, StoreBackend};
use crate::core::{EventLog, ResolutionService};
use crate::domain::{ContentKey, EventType, Format, ResolutionEvent, ResolveResponse};
use crate::store::{MemoryStore, PersistentStore, SqliteStore};

/// tubecache - Tiered content resolution
#[derive(Parser, Debug)]
#[command(name = "tubecache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve content to a playable URL (prints the JSON response)
    Resolve {
        /// Content ID
        content_id: String,

        /// Format (audio or video)
        #[arg(short, long, default_value = "audio")]
        format: Format,

        /// Pretty-print the response
        #[arg(long)]
        pretty: bool,
    },

    /// Show the stored record for a key
    Status {
        /// Content ID
        content_id: String,

        #[arg(short, long, default_value = "audio")]
        format: Format,
    },

    /// Clear a failed record so the key can be resolved again
    Reset {
        /// Content ID
        content_id: String,

        #[arg(short, long, default_value = "audio")]
        format: Format,
    },

    /// Show recent resolution events
    History {
        /// Content ID (all keys if omitted)
        content_id: Option<String>,

        #[arg(short, long, default_value = "audio")]
        format: Format,

        /// Maximum number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Resolve {
                content_id,
                format,
                pretty,
            } => resolve(&content_id, format, pretty).await,
            Commands::Status { content_id, format } => show_status(&content_id, format).await,
            Commands::Reset { content_id, format } => reset(&content_id, format).await,
            Commands::History {
                content_id,
                format,
                limit,
            } => show_history(content_id, format, limit).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Open the record store selected by configuration
fn open_store(cfg: &ResolvedConfig) -> Result<Arc<dyn PersistentStore>> {
    Ok(match cfg.store_backend {
        StoreBackend::Sqlite => {
            if let Some(parent) = cfg.db_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
            }
            let store = SqliteStore::open(&cfg.db_path)
                .with_context(|| format!("Failed to open record store: {}", cfg.db_path.display()))?;
            Arc::new(store)
        }
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    })
}

async fn open_events(cfg: &ResolvedConfig) -> Result<Option<EventLog>> {
    match &cfg.events_path {
        Some(path) => Ok(Some(EventLog::open(path.clone()).await?)),
        None => Ok(None),
    }
}

/// Wire the service from configuration
async fn build_service(cfg: &ResolvedConfig) -> Result<ResolutionService> {
    let store = open_store(cfg)?;

    let telegram = cfg.telegram.clone().context(
        "No archive configured. Set TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID (or archive.chat_id in .tubecache/config.yaml)",
    )?;
    let archive: Arc<dyn ArchiveSearch> =
        Arc::new(TelegramArchive::from_config(telegram, cfg.archive_index_path.clone())?);

    let mut origin = YtDlpOrigin::with_binary_path(cfg.origin.binary_path.clone())
        .with_extra_args(cfg.origin.extra_args.clone());
    if let Some(template) = &cfg.origin.url_template {
        origin = origin.with_url_template(template.clone());
    }
    let origin: Arc<dyn OriginFetchService> = Arc::new(origin);

    let events = open_events(cfg).await?;

    Ok(ResolutionService::new(
        cfg.service.clone(),
        store,
        archive,
        origin,
        events,
    ))
}

/// Resolve one key and print the wire response
async fn resolve(content_id: &str, format: Format, pretty: bool) -> Result<()> {
    let cfg = config::config()?;
    let service = build_service(cfg).await?;

    let response = service.resolve(content_id, format.as_str()).await;
    print_response(&mut std::io::stdout(), &response, pretty)?;

    // Promotion runs after the answer is out; keep the process alive for it
    service.shutdown().await;

    if !response.is_done() {
        eprintln!("[HTTP {}]", response.http_status());
        std::process::exit(1);
    }
    Ok(())
}

/// Write the wire response and flush so it is visible before any teardown
fn print_response(out: &mut impl Write, response: &ResolveResponse, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(response)
    } else {
        serde_json::to_string(response)
    }
    .context("Failed to serialize response")?;

    writeln!(out, "{}", json).context("Failed to write response")?;
    out.flush().context("Failed to flush response")?;
    Ok(())
}

fn parse_key(content_id: &str, format: Format) -> Result<ContentKey> {
    let key = ContentKey::new(content_id, format);
    key.validate()
        .map_err(|reason| anyhow::anyhow!("Invalid content key: {}", reason))?;
    Ok(key)
}

/// Show the stored record for a key
async fn show_status(content_id: &str, format: Format) -> Result<()> {
    let cfg = config::config()?;
    let key = parse_key(content_id, format)?;
    let store = open_store(cfg)?;

    match store.find_by_key(&key).await? {
        Some(record) => {
            println!("Key:       {}", key);
            println!("Record ID: {}", record.id);
            println!("Status:    {}", record.status);
            if let Some(title) = &record.title {
                println!("Title:     {}", title);
            }
            if let Some(duration) = record.duration_seconds {
                println!("Duration:  {}s", duration);
            }
            if let Some(size) = record.size_bytes {
                println!("Size:      {} bytes", size);
            }
            println!(
                "Archived:  {}",
                record.archive_reference.as_deref().unwrap_or("no")
            );
            if let Some(error) = &record.error {
                println!("Error:     {}", error);
            }
            println!("Created:   {}", record.created_at);
            if let Some(resolved) = record.resolved_at {
                println!("Resolved:  {}", resolved);
            }
        }
        None => println!("No record for {}", key),
    }

    Ok(())
}

/// Operator reset of a failed record
async fn reset(content_id: &str, format: Format) -> Result<()> {
    let cfg = config::config()?;
    let key = parse_key(content_id, format)?;
    let store = open_store(cfg)?;

    if store.reset_failed(&key).await? {
        if let Some(events) = open_events(cfg).await? {
            events
                .append_or_warn(&ResolutionEvent::new(&key, EventType::Reset, "failed record cleared"))
                .await;
        }
        println!("Reset {}; the next request will resolve it afresh", key);
    } else {
        println!("No failed record for {}", key);
    }

    Ok(())
}

/// Show recent events, optionally for one key
async fn show_history(content_id: Option<String>, format: Format, limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let Some(events) = open_events(cfg).await? else {
        println!("Event log is disabled");
        return Ok(());
    };

    let key = content_id
        .map(|id| parse_key(&id, format))
        .transpose()?;
    let history = events.tail(key.as_ref(), limit).await?;

    if history.is_empty() {
        println!("No events found");
        return Ok(());
    }

    println!("{:<26} {:<24} {:<20} {:<10} SUMMARY", "TIME", "KEY", "EVENT", "MS");
    println!("{}", "-".repeat(100));

    for event in history {
        let event_type = serde_json::to_value(event.event_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let duration = event
            .duration_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());
        let summary = match &event.error {
            Some(error) => format!("{} ({})", event.summary, error),
            None => event.summary.clone(),
        };
        println!(
            "{:<26} {:<24} {:<20} {:<10} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.key().to_string(),
            event_type,
            duration,
            summary
        );
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("tubecache configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:          {}", paths::home()?.display());
    println!("  Record store:  {} ({:?})", paths::records_db()?.display(), cfg.store_backend);
    println!("  Archive index: {}", paths::archive_index()?.display());
    match &cfg.events_path {
        Some(_) => println!("  Event log:     {}", paths::events()?.display()),
        None => println!("  Event log:     (disabled)"),
    }
    println!();
    println!("Origin:");
    println!("  yt-dlp:        {}", cfg.origin.binary_path);
    println!("  Max attempts:  {}", cfg.service.retry.max_attempts);
    println!("  Attempt limit: {}s", cfg.service.retry.attempt_timeout_seconds);
    println!();
    println!("Archive:");
    match &cfg.telegram {
        // Never print the token
        Some(telegram) => {
            println!("  Telegram chat: {}", telegram.chat_id);
            println!(
                "  File base:     {}",
                telegram.public_file_base.as_deref().unwrap_or("(none, copies not served)")
            );
        }
        None => println!("  (not configured)"),
    }
    println!();
    println!("Tiers:");
    println!(
        "  Cache:         {} entries, TTL {}s",
        cfg.service.cache.capacity, cfg.service.cache.ttl_seconds
    );
    println!("  In-flight:     {}s ticket timeout", cfg.service.inflight.ticket_timeout_seconds);
    println!(
        "  Pending poll:  every {}ms, {} attempts",
        cfg.service.poll.interval_ms, cfg.service.poll.max_attempts
    );
    println!(
        "  Promotion:     {} (lease {}s)",
        if cfg.service.promotion.enabled { "enabled" } else { "disabled" },
        cfg.service.promotion.lease_seconds
    );

    Ok(())
}
