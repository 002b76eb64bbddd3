#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::{FileConfig, PipelineConfig, RunFlags};
use rssdigest::delivery::{Messenger, ParseMode};
use rssdigest::llm::{LlmError, LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// FreshRSS-shaped store with one feed in the "Tech" category
pub async fn create_store(path: &Path) -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("create store");

    for ddl in [
        "CREATE TABLE category (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        "CREATE TABLE feed (id INTEGER PRIMARY KEY, url TEXT, category INTEGER, name TEXT NOT NULL)",
        "CREATE TABLE entry (id BIGINT PRIMARY KEY, guid TEXT, title TEXT, content TEXT, link TEXT, date INTEGER, is_read INTEGER DEFAULT 0, id_feed INTEGER)",
        "INSERT INTO category (id, name) VALUES (1, 'Tech')",
        "INSERT INTO feed (id, url, category, name) VALUES (1, 'https://wire.example.com/rss', 1, 'Wire')",
    ] {
        sqlx::query(ddl).execute(&pool).await.expect("ddl");
    }
    pool
}

/// Insert an entry with a FreshRSS-style id (microsecond timestamp) and return the id
pub async fn insert_entry(pool: &SqlitePool, seq: i64, title: &str, date: DateTime<Utc>) -> i64 {
    let id = date.timestamp() * 1_000_000 + seq;
    sqlx::query(
        "INSERT INTO entry (id, guid, title, content, link, date, id_feed) VALUES (?, ?, ?, ?, ?, ?, 1)",
    )
    .bind(id)
    .bind(format!("guid-{}", id))
    .bind(title)
    .bind(format!("<p>{} happened today.</p>", title))
    .bind(format!("https://example.com/{}", seq))
    .bind(date.timestamp())
    .execute(pool)
    .await
    .expect("insert entry");
    id
}

pub fn config(db_path: &Path, log_dir: &Path, flags: RunFlags) -> PipelineConfig {
    let mut env: HashMap<&str, String> = HashMap::new();
    env.insert("FRESHRSS_DB_PATH", db_path.display().to_string());
    env.insert("USERNAME", "alice".to_string());
    env.insert("GEMINI_API_KEY", "test-key".to_string());
    env.insert("GEMINI_BASE_URL", "http://127.0.0.1:9/v1".to_string());
    env.insert("GEMINI_MODEL_ID", "stub-model".to_string());
    env.insert("STAGE1_MAX_WORKERS", "2".to_string());
    env.insert("TELEGRAM_BOT_TOKEN", "123:abc".to_string());
    env.insert("TELEGRAM_CHAT_ID", "42".to_string());
    env.insert("LOG_DIR", log_dir.display().to_string());

    PipelineConfig::resolve(FileConfig::default(), |key| env.get(key).cloned(), flags)
        .expect("test config")
}

/// Completion stub: fails any article whose title contains "fail", records
/// every prompt, tracks peak concurrency.
pub struct StubLlm {
    pub stage2_reply: Option<String>,
    pub prompts: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl StubLlm {
    pub fn stage1() -> Arc<Self> {
        Arc::new(Self {
            stage2_reply: None,
            prompts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// `None` makes every stage-2 call fail
    pub fn stage2(reply: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            stage2_reply: reply.map(str::to_string),
            prompts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl LlmProvider for StubLlm {
    fn model(&self) -> &str {
        "stub-model"
    }

    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let content = if request.prompt.starts_with("Title: ") {
            if request.prompt.lines().next().unwrap_or_default().contains("fail") {
                return Err(LlmError::Timeout(Duration::from_secs(1)));
            }
            format!("Summary of {}", request.prompt.lines().next().unwrap_or_default())
        } else {
            match &self.stage2_reply {
                Some(reply) => reply.clone(),
                None => {
                    return Err(LlmError::Api {
                        status: 500,
                        body: "stage 2 down".to_string(),
                    })
                }
            }
        };

        Ok(LlmResponse {
            content,
            usage: UsageMetadata::default(),
            model: "stub-model".to_string(),
        })
    }
}

#[derive(Default)]
pub struct StubMessenger {
    pub fail: bool,
    pub sent: Mutex<Vec<(String, ParseMode)>>,
    pub attempts: AtomicUsize,
}

impl StubMessenger {
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Messenger for StubMessenger {
    async fn send_message(&self, text: &str, mode: ParseMode) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("Telegram API error 400: chat not found");
        }
        self.sent.lock().unwrap().push((text.to_string(), mode));
        Ok(())
    }
}

/// Accepts a message and never answers
pub struct StalledMessenger;

#[async_trait::async_trait]
impl Messenger for StalledMessenger {
    async fn send_message(&self, _text: &str, _mode: ParseMode) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}
