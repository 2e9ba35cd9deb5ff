use std::path::PathBuf;

use tokio::time::Duration;

use crate::{error::ConfigError, orchestrator::MAX_DOWNLOAD_RETRIES};

const DEFAULT_DATABASE_URL: &str = "sqlite://downloads.db";
const DEFAULT_BRAND_NAME: &str = "JustPaste";
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_STALE_SCRATCH_SECONDS: u64 = 2 * 60 * 60;
const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub bind_addr: String,
    pub database_url: String,
    pub scratch_root: PathBuf,
    pub max_download_retries: usize,
    pub yt_dlp_bin: String,
    pub yt_dlp_timeout: Duration,
    pub max_concurrent_downloads: usize,
    pub stale_scratch_seconds: u64,
    pub brand_name: String,
    /// `None` allows any origin.
    pub allowed_origins: Option<Vec<String>>,
}

impl Config {
    /// Defaults for everything except the API key.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            bind_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            scratch_root: std::env::temp_dir().join("media-fetch"),
            max_download_retries: MAX_DOWNLOAD_RETRIES,
            yt_dlp_bin: DEFAULT_YT_DLP_BIN.to_string(),
            yt_dlp_timeout: Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            stale_scratch_seconds: DEFAULT_STALE_SCRATCH_SECONDS,
            brand_name: DEFAULT_BRAND_NAME.to_string(),
            allowed_origins: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = read_string_env("API_KEY").ok_or(ConfigError::MissingApiKey)?;
        let defaults = Self::with_api_key(api_key);

        Ok(Self {
            bind_addr: resolve_bind_addr(),
            database_url: read_string_env("DATABASE_URL").unwrap_or(defaults.database_url),
            scratch_root: read_string_env("SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_root),
            max_download_retries: read_usize_env("MAX_DOWNLOAD_RETRIES")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_download_retries),
            yt_dlp_bin: read_string_env("YT_DLP_BIN").unwrap_or(defaults.yt_dlp_bin),
            yt_dlp_timeout: read_u64_env("YT_DLP_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.yt_dlp_timeout),
            max_concurrent_downloads: read_usize_env("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_concurrent_downloads),
            stale_scratch_seconds: read_u64_env("STALE_SCRATCH_SECONDS")
                .unwrap_or(defaults.stale_scratch_seconds),
            brand_name: read_string_env("BRAND_NAME").unwrap_or(defaults.brand_name),
            allowed_origins: read_string_env("ALLOWED_ORIGINS").map(|value| parse_list(&value)),
            api_key: defaults.api_key,
        })
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    format!("127.0.0.1:{DEFAULT_PORT}")
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
