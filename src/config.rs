//! Configuration for tubecache.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (TUBECACHE_HOME, TUBECACHE_DB,
//!    TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID, TELEGRAM_PUBLIC_FILE_BASE,
//!    YTDLP_PATH)
//! 2. Config file (.tubecache/config.yaml)
//! 3. Defaults (~/.tubecache)
//!
//! Config file discovery:
//! - Searches current directory and parents for .tubecache/config.yaml
//! - Paths in config file are relative to the .tubecache/ directory

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::TelegramConfig;
use crate::core::{CacheConfig, InFlightConfig, PollConfig, PromotionConfig, RetryPolicy, ServiceConfig};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub inflight: InFlightConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub origin: OriginConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub promotion: PromotionConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .tubecache/)
    pub home: Option<String>,
    /// SQLite record store
    pub db: Option<String>,
    /// Archive upload index
    pub archive_index: Option<String>,
    /// Resolution event log
    pub events: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OriginConfig {
    /// yt-dlp binary
    pub binary_path: Option<String>,
    /// Source page URL with `{id}` placeholder
    pub url_template: Option<String>,
    /// Extra arguments for every yt-dlp call
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// How long a stored direct URL is trusted
    pub direct_url_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Which record store backs the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveConfig {
    /// Prefer TELEGRAM_BOT_TOKEN; a token in a checked-in file leaks
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub api_base: Option<String>,
    /// Token-free root that serves archived files to clients
    pub public_file_base: Option<String>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_events_enabled")]
    pub enabled: bool,
}

fn default_events_enabled() -> bool {
    true
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: default_events_enabled(),
        }
    }
}

/// Origin adapter settings after resolution
#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub binary_path: String,
    pub url_template: Option<String>,
    pub extra_args: Vec<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to tubecache home (state)
    pub home: PathBuf,
    /// SQLite record store
    pub db_path: PathBuf,
    /// Archive upload index
    pub archive_index_path: PathBuf,
    /// Event log, if enabled
    pub events_path: Option<PathBuf>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub store_backend: StoreBackend,
    pub origin: OriginSettings,
    /// Present only when both token and chat are known
    pub telegram: Option<TelegramConfig>,
    /// Tier tuning handed to the resolution service
    pub service: ServiceConfig,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".tubecache").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file, environment and defaults.
///
/// `env` is injected so the precedence rules can be tested without
/// touching the process environment.
fn build_config<F>(
    config_file: Option<PathBuf>,
    file: ConfigFile,
    env: F,
    default_home: PathBuf,
) -> ResolvedConfig
where
    F: Fn(&str) -> Option<String>,
{
    // Paths in the file are relative to .tubecache/
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    let from_file = |value: &Option<String>| -> Option<PathBuf> {
        match (&base_dir, value) {
            (Some(base), Some(v)) => Some(resolve_path(base, v)),
            (None, Some(v)) => Some(PathBuf::from(v)),
            _ => None,
        }
    };

    let home = env("TUBECACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| from_file(&file.paths.home))
        .unwrap_or(default_home);

    let db_path = env("TUBECACHE_DB")
        .map(PathBuf::from)
        .or_else(|| from_file(&file.paths.db))
        .unwrap_or_else(|| home.join(paths::DB_FILE));

    let archive_index_path = from_file(&file.paths.archive_index)
        .unwrap_or_else(|| home.join(paths::ARCHIVE_INDEX_FILE));

    let events_path = if file.events.enabled {
        Some(from_file(&file.paths.events).unwrap_or_else(|| home.join(paths::EVENTS_FILE)))
    } else {
        None
    };

    let origin = OriginSettings {
        binary_path: env("YTDLP_PATH")
            .or(file.origin.binary_path.clone())
            .unwrap_or_else(|| "yt-dlp".to_string()),
        url_template: file.origin.url_template.clone(),
        extra_args: file.origin.extra_args.clone(),
    };

    let bot_token = env("TELEGRAM_BOT_TOKEN").or(file.archive.bot_token.clone());
    let chat_id = env("TELEGRAM_CHAT_ID").or(file.archive.chat_id.clone());
    let telegram = match (bot_token, chat_id) {
        (Some(bot_token), Some(chat_id)) if !bot_token.is_empty() && !chat_id.is_empty() => {
            let mut telegram = TelegramConfig {
                bot_token,
                chat_id,
                api_base: "https://api.telegram.org".to_string(),
                public_file_base: env("TELEGRAM_PUBLIC_FILE_BASE").or(file.archive.public_file_base.clone()),
                request_timeout_seconds: 300,
            };
            if let Some(api_base) = &file.archive.api_base {
                telegram.api_base = api_base.clone();
            }
            if let Some(timeout) = file.archive.request_timeout_seconds {
                telegram.request_timeout_seconds = timeout;
            }
            Some(telegram)
        }
        _ => None,
    };

    let mut service = ServiceConfig {
        cache: file.cache,
        inflight: file.inflight,
        poll: file.poll,
        retry: file.origin.retry,
        promotion: file.promotion,
        ..ServiceConfig::default()
    };
    if let Some(ttl) = file.origin.direct_url_ttl_seconds {
        service.direct_url_ttl_seconds = ttl;
    }

    ResolvedConfig {
        home,
        db_path,
        archive_index_path,
        events_path,
        config_file,
        store_backend: file.store.backend,
        origin,
        telegram,
        service,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".tubecache");

    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(build_config(
        config_file,
        file,
        |name| std::env::var(name).ok(),
        default_home,
    ))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

// ============================================================================
// Convenience functions
// ============================================================================

/// Get the tubecache home directory (state).
pub fn tubecache_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the SQLite record store path
pub fn db_path() -> Result<PathBuf> {
    Ok(config()?.db_path.clone())
}

/// Get the archive index path
pub fn archive_index_path() -> Result<PathBuf> {
    Ok(config()?.archive_index_path.clone())
}

/// Get the event log path (even when logging is disabled)
pub fn events_path() -> Result<PathBuf> {
    let cfg = config()?;
    Ok(cfg
        .events_path
        .clone()
        .unwrap_or_else(|| cfg.home.join(paths::EVENTS_FILE)))
}
