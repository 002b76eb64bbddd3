use anyhow::Context;
use chrono::Utc;
use common::{ConfigError, PipelineConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::delivery::{deliver, DeliveryOutcome, Messenger, ParseMode, TelegramSender};
use crate::digest::aggregate;
use crate::error::DigestError;
use crate::history::{DigestHistory, ProcessedIds};
use crate::llm::remote::RemoteLlmProvider;
use crate::llm::LlmProvider;
use crate::model::DigestResult;
use crate::source::ArticleSource;
use crate::summarizer::summarize_all;

/// Per-request timeout for the messaging endpoint
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    /// New articles fed into stage 1
    pub articles_found: usize,
    pub digest: DigestResult,
    pub delivery: DeliveryOutcome,
    pub saved_to: Option<PathBuf>,
    pub send_requested: bool,
}

impl RunReport {
    /// A failed delivery fails the run only when it was requested and the
    /// digest was not kept anywhere else.
    pub fn is_success(&self) -> bool {
        !(self.send_requested && self.delivery.is_failure() && self.saved_to.is_none())
    }
}

/// Fetch -> stage 1 -> stage 2 -> persist -> deliver, for one configuration
pub struct Pipeline {
    config: PipelineConfig,
    stage1: Arc<dyn LlmProvider>,
    stage2: Arc<dyn LlmProvider>,
    messenger: Option<Arc<dyn Messenger>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        stage1: Arc<dyn LlmProvider>,
        stage2: Arc<dyn LlmProvider>,
        messenger: Option<Arc<dyn Messenger>>,
    ) -> Self {
        Self {
            config,
            stage1,
            stage2,
            messenger,
        }
    }

    /// Wire the remote completion endpoint and Telegram from configuration
    pub fn from_config(config: PipelineConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rssdigest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build reqwest client")?;

        let llm = &config.llm;
        let stage1 = RemoteLlmProvider::new(&llm.base_url, &llm.api_key, &llm.stage1_model)
            .with_defaults(llm.timeout, None, 0.7)
            .with_client(client.clone());
        let stage2 = RemoteLlmProvider::new(&llm.base_url, &llm.api_key, &llm.stage2_model)
            .with_defaults(llm.timeout, None, 0.7)
            .with_client(client);

        let messenger = TelegramSender::from_config(&config.telegram, DELIVERY_TIMEOUT)?
            .map(|sender| Arc::new(sender) as Arc<dyn Messenger>);

        Ok(Self::new(config, Arc::new(stage1), Arc::new(stage2), messenger))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<RunReport, DigestError> {
        let hours = self.config.source.hours_back;
        let send_requested = self.config.run.send;
        info!("Starting RSS digest run (looking back {} hours)", hours);

        let since = chrono::Duration::try_hours(i64::from(hours))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| ConfigError::Invalid {
                key: "HOURS_BACK",
                value: hours.to_string(),
            })?;
        let source = ArticleSource::open(&self.config.source).await?;
        let fetched = source.fetch_recent(since).await;
        source.close().await;
        let mut articles = fetched?;

        let processed_ids = ProcessedIds::new(self.config.output.processed_ids_file());
        let seen = processed_ids.load().await;
        let total = articles.len();
        articles.retain(|a| !seen.contains(&a.id));
        if articles.len() < total {
            info!("Skipped {} entries already included in a digest", total - articles.len());
        }

        if articles.is_empty() {
            info!("No new articles in the past {} hours, nothing to digest", hours);
            return Ok(RunReport {
                articles_found: 0,
                digest: DigestResult::no_content(0, 0),
                delivery: DeliveryOutcome::Skipped("no new articles".to_string()),
                saved_to: None,
                send_requested,
            });
        }

        let articles_found = articles.len();
        let ids: Vec<i64> = articles.iter().map(|a| a.id).collect();
        info!("Found {} new articles in the past {} hours", articles_found, hours);

        let summaries =
            match summarize_all(self.stage1.clone(), articles, self.config.llm.max_workers).await {
                Ok(summaries) => summaries,
                Err(e) => return Err(self.fail(e).await),
            };
        debug_assert_eq!(summaries.len(), articles_found);

        let history = DigestHistory::new(self.config.output.digest_history_file());
        let previous = history.load().await;
        let digest = match aggregate(self.stage2.as_ref(), &summaries, &previous).await {
            Ok(digest) => digest,
            Err(e) => return Err(self.fail(e).await),
        };

        let saved_to = if self.config.run.save {
            match save_digest(&digest, &self.config.output.digests_dir()).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            }
        } else {
            None
        };

        let delivery = deliver(&digest, self.messenger.as_deref(), send_requested).await;
        if let DeliveryOutcome::Sent { .. } = delivery {
            if let Err(e) = history.push(&digest.text).await {
                warn!("Failed to save digest history: {:#}", e);
            }
        }

        // Every fetched id counts, stage-1 failures included, but only once
        // the digest reached an output (sent, saved, or printed with --no-send).
        let delivered = matches!(delivery, DeliveryOutcome::Sent { .. });
        if !digest.is_empty() && (delivered || saved_to.is_some() || !send_requested) {
            if let Err(e) = processed_ids.record(&ids, Utc::now()).await {
                warn!("Failed to update processed ids: {:#}", e);
            }
        }

        Ok(RunReport {
            articles_found,
            digest,
            delivery,
            saved_to,
            send_requested,
        })
    }

    /// Log a fatal stage error and tell the chat, when sending is enabled
    async fn fail(&self, err: DigestError) -> DigestError {
        error!("{}", err);
        if !self.config.run.send {
            return err;
        }
        if let Some(messenger) = &self.messenger {
            let notice = format!("Digest generation failed: {}", err);
            if let Err(e) = messenger.send_message(&notice, ParseMode::Plain).await {
                warn!("Failed to send failure notice: {:#}", e);
            }
        }
        err
    }
}

/// Write the digest text to `<dir>/rss-digest-YYYYMMDD-HHMM.md`.
pub async fn save_digest(digest: &DigestResult, dir: &Path) -> Result<PathBuf, DigestError> {
    let path = dir.join(format!(
        "rss-digest-{}.md",
        digest.generated_at.format("%Y%m%d-%H%M")
    ));

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DigestError::PersistenceFailed(format!("{}: {}", dir.display(), e)))?;
    tokio::fs::write(&path, &digest.text)
        .await
        .map_err(|e| DigestError::PersistenceFailed(format!("{}: {}", path.display(), e)))?;

    info!(path = %path.display(), "Digest saved");
    Ok(path)
}
