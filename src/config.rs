use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::{AppError, AppResult};

pub const DATA_DIR_ENV: &str = "FIELDSYNC_DATA_DIR";
pub const API_URL_ENV: &str = "FIELDSYNC_API_URL";
pub const MAX_RETRIES_ENV: &str = "FIELDSYNC_MAX_RETRIES";
pub const PHOTO_MAX_RETRIES_ENV: &str = "FIELDSYNC_PHOTO_MAX_RETRIES";
pub const SYNC_INTERVAL_ENV: &str = "FIELDSYNC_SYNC_INTERVAL_SECS";
pub const REFRESH_INTERVAL_ENV: &str = "FIELDSYNC_REFRESH_INTERVAL_SECS";
pub const REQUEST_TIMEOUT_ENV: &str = "FIELDSYNC_REQUEST_TIMEOUT_SECS";
pub const BACKOFF_BASE_ENV: &str = "FIELDSYNC_BACKOFF_BASE_MS";
pub const BACKOFF_MAX_ENV: &str = "FIELDSYNC_BACKOFF_MAX_MS";
pub const PROBE_INTERVAL_ENV: &str = "FIELDSYNC_PROBE_INTERVAL_SECS";

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(2_000);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(300_000);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15);

const APP_DIR_NAME: &str = "fieldsync";
const DB_FILE_NAME: &str = "fieldsync.sqlite3";
const PHOTOS_DIR_NAME: &str = "photos";
const SESSION_FILE_NAME: &str = "session.json";
const LOGS_DIR_NAME: &str = "logs";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub api_url: String,
    pub max_retries: u32,
    pub photo_max_retries: u32,
    pub sync_interval: Duration,
    pub refresh_interval: Duration,
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub probe_interval: Duration,
}

impl SyncConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            api_url: DEFAULT_API_URL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            photo_max_retries: DEFAULT_MAX_RETRIES,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    /// Reads overrides from the process environment.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match lookup(DATA_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let mut config = Self::with_data_dir(data_dir);

        if let Some(url) = lookup(API_URL_ENV).filter(|v| !v.trim().is_empty()) {
            config.api_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(value) = parse_u64(&lookup, MAX_RETRIES_ENV)? {
            config.max_retries = to_u32(MAX_RETRIES_ENV, value)?;
        }
        if let Some(value) = parse_u64(&lookup, PHOTO_MAX_RETRIES_ENV)? {
            config.photo_max_retries = to_u32(PHOTO_MAX_RETRIES_ENV, value)?;
        }
        if let Some(secs) = parse_nonzero(&lookup, SYNC_INTERVAL_ENV)? {
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_nonzero(&lookup, REFRESH_INTERVAL_ENV)? {
            config.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_nonzero(&lookup, REQUEST_TIMEOUT_ENV)? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&lookup, BACKOFF_BASE_ENV)? {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, BACKOFF_MAX_ENV)? {
            config.backoff_max = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_nonzero(&lookup, PROBE_INTERVAL_ENV)? {
            config.probe_interval = Duration::from_secs(secs);
        }

        if config.backoff_max < config.backoff_base {
            return Err(AppError::new(
                "CONFIG/INVALID_VALUE",
                "Maximum backoff must not be shorter than the base backoff",
            )
            .with_context("var", BACKOFF_MAX_ENV));
        }

        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn photos_dir(&self) -> PathBuf {
        self.data_dir.join(PHOTOS_DIR_NAME)
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(LOGS_DIR_NAME)
    }

    pub fn mutation_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_base, self.backoff_max)
    }

    pub fn photo_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.photo_max_retries, self.backoff_base, self.backoff_max)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn default_data_dir() -> AppResult<PathBuf> {
    let base = match dirs::data_dir() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    Ok(base.join(APP_DIR_NAME))
}

fn parse_u64<F>(lookup: &F, var: &str) -> AppResult<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|err| {
            AppError::new("CONFIG/INVALID_VALUE", format!("Invalid value for {var}"))
                .with_context("var", var)
                .with_context("value", raw.clone())
                .with_cause(AppError::from(err.to_string()))
        }),
    }
}

fn parse_nonzero<F>(lookup: &F, var: &str) -> AppResult<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_u64(lookup, var)? {
        Some(0) => Err(
            AppError::new("CONFIG/INVALID_VALUE", format!("{var} must be greater than zero"))
                .with_context("var", var),
        ),
        other => Ok(other),
    }
}

fn to_u32(var: &str, value: u64) -> AppResult<u32> {
    u32::try_from(value).map_err(|_| {
        AppError::new("CONFIG/INVALID_VALUE", format!("{var} is out of range"))
            .with_context("var", var)
            .with_context("value", value.to_string())
    })
}
