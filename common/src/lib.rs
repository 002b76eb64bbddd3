/*!
common/src/lib.rs

Shared configuration types and store helpers for rssdigest.

This file provides:
- Config file structures (deserialized from TOML, every field optional)
- Resolution of file + environment into one immutable `PipelineConfig`
- A helper to open the FreshRSS SQLite store read-only
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HOURS_BACK: u32 = 8;
/// Longest accepted lookback: ten years
pub const MAX_HOURS_BACK: u32 = 24 * 366 * 10;
pub const DEFAULT_STAGE1_MAX_WORKERS: usize = 20;
pub const DEFAULT_LLM_TIMEOUT_SECONDS: u64 = 120;
pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Errors raised while building the run configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// `[source]` section: where the FreshRSS store lives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSection {
    /// Either the user's `db.sqlite` or the FreshRSS data directory
    pub db_path: Option<String>,
    pub username: Option<String>,
    pub hours_back: Option<u32>,
}

/// `[llm]` section: OpenAI-compatible completion endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSection {
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key
    pub api_key_env: Option<String>,
    pub stage1_model: Option<String>,
    pub stage2_model: Option<String>,
    /// Legacy single-model setting, used when `stage2_model` is absent
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_workers: Option<usize>,
}

/// `[telegram]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramSection {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub api_url: Option<String>,
}

/// `[output]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSection {
    pub log_dir: Option<String>,
}

/// Top-level config file (deserialized from rss-digest.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub telegram: TelegramSection,
    #[serde(default)]
    pub output: OutputSection,
}

impl FileConfig {
    /// Load a config file asynchronously.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(toml::from_str(&data)?)
    }

    /// Load an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
            let val: toml::Value = toml::from_str(&data)?;
            merge_toml(&mut config_value, val);
        }

        Ok(config_value.try_into()?)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Options coming from the command line for a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunFlags {
    /// Overrides the configured lookback window
    pub hours: Option<u32>,
    pub send: bool,
    pub save: bool,
    pub debug: bool,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            hours: None,
            send: true,
            save: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub db_path: PathBuf,
    pub username: String,
    pub hours_back: u32,
}

#[derive(Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub stage1_model: String,
    pub stage2_model: String,
    pub timeout: Duration,
    pub max_workers: usize,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("stage1_model", &self.stage1_model)
            .field("stage2_model", &self.stage2_model)
            .field("timeout", &self.timeout)
            .field("max_workers", &self.max_workers)
            .finish()
    }
}

#[derive(Clone)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub api_url: String,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("chat_id", &self.chat_id)
            .field("api_url", &self.api_url)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Holds the log file, processed ids, digest history and saved digests
    pub log_dir: PathBuf,
}

impl OutputConfig {
    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("rss-digest.log")
    }

    pub fn processed_ids_file(&self) -> PathBuf {
        self.log_dir.join("processed_entry_ids.json")
    }

    pub fn digest_history_file(&self) -> PathBuf {
        self.log_dir.join("digest_history.json")
    }

    pub fn digests_dir(&self) -> PathBuf {
        self.log_dir.join("digests")
    }
}

/// Immutable configuration for one run, built once at startup.
///
/// Every fallback (model chain, defaults, CLI overrides) is resolved here, so
/// components never look at the environment themselves.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub llm: LlmConfig,
    pub telegram: TelegramConfig,
    pub output: OutputConfig,
    pub run: RunFlags,
}

impl PipelineConfig {
    /// Resolve a config file, environment lookups and CLI flags into a run configuration.
    ///
    /// `env` returns `None` for unset (or blank) variables; use [`env_lookup`] for the
    /// process environment.
    pub fn resolve<F>(file: FileConfig, env: F, run: RunFlags) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let FileConfig {
            source,
            llm,
            telegram,
            output,
        } = file;

        let db_path = env("FRESHRSS_DB_PATH")
            .or(source.db_path)
            .ok_or(ConfigError::Missing("FRESHRSS_DB_PATH"))?;
        let username = env("USERNAME")
            .or(source.username)
            .ok_or(ConfigError::Missing("USERNAME"))?;
        let hours_back = match run.hours {
            Some(hours) => hours,
            None => match env("HOURS_BACK") {
                Some(v) => parse_var("HOURS_BACK", &v)?,
                None => source.hours_back.unwrap_or(DEFAULT_HOURS_BACK),
            },
        };
        if hours_back == 0 || hours_back > MAX_HOURS_BACK {
            return Err(ConfigError::Invalid {
                key: "HOURS_BACK",
                value: hours_back.to_string(),
            });
        }

        let api_key_env = llm
            .api_key_env
            .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());
        let api_key = env(&api_key_env).ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;
        let base_url = env("GEMINI_BASE_URL")
            .or(llm.base_url)
            .ok_or(ConfigError::Missing("GEMINI_BASE_URL"))?;
        url::Url::parse(&base_url).map_err(|_| ConfigError::Invalid {
            key: "GEMINI_BASE_URL",
            value: base_url.clone(),
        })?;

        // stage-2 <- legacy single model; stage-1 <- stage-2
        let stage2_model = env("GEMINI_STAGE2_MODEL_ID")
            .or(llm.stage2_model)
            .or_else(|| env("GEMINI_MODEL_ID"))
            .or(llm.model)
            .ok_or(ConfigError::Missing("GEMINI_STAGE2_MODEL_ID"))?;
        let stage1_model = env("GEMINI_STAGE1_MODEL_ID")
            .or(llm.stage1_model)
            .unwrap_or_else(|| stage2_model.clone());

        let max_workers = match env("STAGE1_MAX_WORKERS") {
            Some(v) => parse_var("STAGE1_MAX_WORKERS", &v)?,
            None => llm.max_workers.unwrap_or(DEFAULT_STAGE1_MAX_WORKERS),
        };
        if max_workers == 0 {
            return Err(ConfigError::Invalid {
                key: "STAGE1_MAX_WORKERS",
                value: "0".to_string(),
            });
        }
        let timeout_secs = match env("LLM_TIMEOUT_SECONDS") {
            Some(v) => parse_var("LLM_TIMEOUT_SECONDS", &v)?,
            None => llm.timeout_seconds.unwrap_or(DEFAULT_LLM_TIMEOUT_SECONDS),
        };

        let bot_token = env("TELEGRAM_BOT_TOKEN").or(telegram.bot_token);
        let chat_id = env("TELEGRAM_CHAT_ID").or(telegram.chat_id);
        if run.send {
            if bot_token.is_none() {
                return Err(ConfigError::Missing("TELEGRAM_BOT_TOKEN"));
            }
            if chat_id.is_none() {
                return Err(ConfigError::Missing("TELEGRAM_CHAT_ID"));
            }
        }
        let api_url = env("TELEGRAM_API_URL")
            .or(telegram.api_url)
            .unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string());

        let log_dir = env("LOG_DIR")
            .or(output.log_dir)
            .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string());

        Ok(Self {
            source: SourceConfig {
                db_path: PathBuf::from(db_path),
                username,
                hours_back,
            },
            llm: LlmConfig {
                base_url,
                api_key,
                stage1_model,
                stage2_model,
                timeout: Duration::from_secs(timeout_secs),
                max_workers,
            },
            telegram: TelegramConfig {
                bot_token,
                chat_id,
                api_url,
            },
            output: OutputConfig {
                log_dir: PathBuf::from(log_dir),
            },
            run: RunFlags {
                hours: Some(hours_back),
                ..run
            },
        })
    }
}

/// Process environment lookup treating blank values as unset.
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// Locate the SQLite file for `username`.
///
/// A directory is treated as the FreshRSS data directory, where each account
/// owns `users/<username>/db.sqlite`. Anything else is used as-is.
pub fn resolve_user_db(db_path: &Path, username: &str) -> PathBuf {
    if db_path.is_dir() {
        db_path.join("users").join(username).join("db.sqlite")
    } else {
        db_path.to_path_buf()
    }
}

/// Open the feed-reader store read-only.
///
/// The file must already exist; nothing is ever created or written. A single
/// connection is enough for the one query a run makes.
pub async fn open_source_pool(path: &Path, timeout: Duration) -> Result<SqlitePool> {
    if !path.is_file() {
        anyhow::bail!("store not found at {}", path.display());
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .create_if_missing(false);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(timeout)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open sqlite store at path: {}", path.display()))?;

    Ok(pool)
}
