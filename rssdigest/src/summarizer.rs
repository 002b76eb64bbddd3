// Stage 1: one completion request per article, under a worker cap
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::DigestError;
use crate::llm::{LlmError, LlmProvider, LlmRequest};
use crate::model::{Article, ArticleSummary};

/// Longest article body handed to the model, in characters
pub const MAX_ARTICLE_CHARS: usize = 6000;

pub const STAGE1_SYSTEM_PROMPT: &str = "You summarize a single news article for a daily digest. \
Write 2-3 plain sentences covering who did what, the key numbers, and why it matters. \
Do not add opinions, headings, markdown or links. \
Write in the same language as the article. \
If the article has no real content (paywall stub, cookie notice), reply with one sentence saying so.";

/// Plain-text article body for the prompt: HTML stripped, length capped.
pub fn article_text(article: &Article) -> String {
    let text = match html2text::from_read(article.content.as_bytes(), 100) {
        Ok(text) => text,
        Err(e) => {
            debug!(article_id = article.id, "HTML conversion failed, using raw content: {}", e);
            article.content.clone()
        }
    };
    truncate_chars(text.trim(), MAX_ARTICLE_CHARS)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

fn build_prompt(article: &Article) -> String {
    let mut prompt = format!("Title: {}\n", article.title);
    if let Some(feed) = &article.feed {
        prompt.push_str(&format!("Source: {}\n", feed));
    }
    prompt.push_str(&format!("Link: {}\n", article.link));
    prompt.push_str(&format!(
        "Published: {}\n\n",
        article.published_at.format("%Y-%m-%d %H:%M UTC")
    ));
    prompt.push_str(&article_text(article));
    prompt
}

async fn request_summary<P: LlmProvider + ?Sized>(
    provider: &P,
    article: &Article,
) -> Result<String, LlmError> {
    let response = provider
        .generate(LlmRequest {
            system: Some(STAGE1_SYSTEM_PROMPT.to_string()),
            prompt: build_prompt(article),
            temperature: Some(0.3),
            ..LlmRequest::default()
        })
        .await?;

    let text = response.content.trim();
    if text.is_empty() {
        return Err(LlmError::Empty);
    }
    debug!(
        article_id = article.id,
        tokens = response.usage.total_tokens,
        "article summarized"
    );
    Ok(text.to_string())
}

/// Summary plus whether the endpoint rejected our credentials
async fn summarize_checked<P: LlmProvider + ?Sized>(
    provider: &P,
    article: &Article,
) -> (ArticleSummary, bool) {
    match request_summary(provider, article).await {
        Ok(text) => (ArticleSummary::succeeded(article, text), false),
        Err(e) => {
            warn!(article_id = article.id, "summarization failed: {}", e);
            (ArticleSummary::failed(article, e.to_string()), e.is_credential_error())
        }
    }
}

/// Summarize one article. Failures come back as a failed summary, never an error.
pub async fn summarize_article<P: LlmProvider + ?Sized>(
    provider: &P,
    article: &Article,
) -> ArticleSummary {
    summarize_checked(provider, article).await.0
}

/// Summarize every article with at most `max_workers` requests in flight.
///
/// Returns exactly one summary per input article, in input order. Returns only
/// when every task has finished. Fails as a whole only when every request was
/// rejected for bad credentials.
pub async fn summarize_all(
    provider: Arc<dyn LlmProvider>,
    articles: Vec<Article>,
    max_workers: usize,
) -> Result<Vec<ArticleSummary>, DigestError> {
    if articles.is_empty() {
        return Ok(Vec::new());
    }

    info!(
        "Stage1: summarizing {} articles with up to {} workers (model {})",
        articles.len(),
        max_workers,
        provider.model()
    );

    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let articles: Vec<Arc<Article>> = articles.into_iter().map(Arc::new).collect();
    let mut handles = Vec::with_capacity(articles.len());

    for article in &articles {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| DigestError::SummarizationUnavailable(e.to_string()))?;
        let provider = provider.clone();
        let article = article.clone();
        handles.push(tokio::spawn(async move {
            let outcome = summarize_checked(provider.as_ref(), &article).await;
            drop(permit);
            outcome
        }));
    }

    // Barrier: nothing is returned until every task has settled
    let results = join_all(handles).await;

    let mut summaries = Vec::with_capacity(articles.len());
    let mut credential_failures = 0;
    let mut last_credential_error = None;

    for (article, joined) in articles.iter().zip(results) {
        let summary = match joined {
            Ok((summary, rejected)) => {
                if rejected {
                    credential_failures += 1;
                    last_credential_error = summary.error().map(str::to_string);
                }
                summary
            }
            Err(join_err) => {
                warn!(article_id = article.id, "summarization task aborted: {}", join_err);
                ArticleSummary::failed(article, format!("task aborted: {}", join_err))
            }
        };
        summaries.push(summary);
    }

    if credential_failures == summaries.len() {
        return Err(DigestError::SummarizationUnavailable(
            last_credential_error.unwrap_or_else(|| "credentials rejected".to_string()),
        ));
    }

    let failed = summaries.iter().filter(|s| !s.is_success()).count();
    info!(
        "Stage1: {}/{} articles summarized, {} failed",
        summaries.len() - failed,
        summaries.len(),
        failed
    );
    Ok(summaries)
}
