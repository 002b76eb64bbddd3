use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// One feed entry as read from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub link: String,
    pub published_at: DateTime<Utc>,
    /// Raw body, usually HTML
    pub content: String,
    pub feed: Option<String>,
    pub category: Option<String>,
}

/// Result of summarizing a single article in stage 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SummaryOutcome {
    Summarized(String),
    Failed(String),
}

/// Stage-1 output for one article. Title, link and feed are copied so stage 2
/// can cite the source without holding on to the article body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleSummary {
    pub article_id: i64,
    pub title: String,
    pub link: String,
    pub feed: Option<String>,
    pub outcome: SummaryOutcome,
}

impl ArticleSummary {
    pub fn succeeded(article: &Article, text: impl Into<String>) -> Self {
        Self::with_outcome(article, SummaryOutcome::Summarized(text.into()))
    }

    pub fn failed(article: &Article, detail: impl Into<String>) -> Self {
        Self::with_outcome(article, SummaryOutcome::Failed(detail.into()))
    }

    fn with_outcome(article: &Article, outcome: SummaryOutcome) -> Self {
        Self {
            article_id: article.id,
            title: article.title.clone(),
            link: article.link.clone(),
            feed: article.feed.clone(),
            outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SummaryOutcome::Summarized(_))
    }

    pub fn text(&self) -> Option<&str> {
        match &self.outcome {
            SummaryOutcome::Summarized(text) => Some(text),
            SummaryOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            SummaryOutcome::Failed(detail) => Some(detail),
            SummaryOutcome::Summarized(_) => None,
        }
    }
}

/// A topic heading and its bullet entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSection {
    pub topic: String,
    pub bullets: Vec<String>,
}

/// Final stage-2 output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestResult {
    /// Empty when there was nothing to digest
    pub sections: Vec<DigestSection>,
    pub generated_at: DateTime<Local>,
    /// Articles that went through stage 1
    pub processed: usize,
    /// Of those, how many could not be summarized
    pub failed: usize,
    /// Rendered markdown: title, sections, footer
    pub text: String,
}

impl DigestResult {
    pub fn new(sections: Vec<DigestSection>, processed: usize, failed: usize) -> Self {
        let generated_at = Local::now();
        let text = render(&sections, generated_at, processed, failed);
        Self {
            sections,
            generated_at,
            processed,
            failed,
            text,
        }
    }

    /// Well-formed digest for a run with nothing to report
    pub fn no_content(processed: usize, failed: usize) -> Self {
        Self::new(Vec::new(), processed, failed)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.processed - self.failed
    }

    pub fn title(&self) -> String {
        title_line(self.generated_at)
    }

    /// Footer describing partial failures, if any
    pub fn footer(&self) -> Option<String> {
        footer_line(self.processed, self.failed)
    }
}

fn title_line(at: DateTime<Local>) -> String {
    format!("# RSS Digest - {}", at.format("%Y/%m/%d %H:%M"))
}

fn footer_line(processed: usize, failed: usize) -> Option<String> {
    if failed == 0 {
        return None;
    }
    let noun = if failed == 1 { "article" } else { "articles" };
    Some(format!(
        "_Summarized {}/{} articles; {} {} failed._",
        processed - failed,
        processed,
        failed,
        noun
    ))
}

fn render(
    sections: &[DigestSection],
    at: DateTime<Local>,
    processed: usize,
    failed: usize,
) -> String {
    let mut out = title_line(at);
    out.push_str("\n\n");

    if sections.is_empty() {
        out.push_str("No new content to digest.");
    } else {
        let body: Vec<String> = sections.iter().map(render_section).collect();
        out.push_str(&body.join("\n\n"));
    }

    if let Some(footer) = footer_line(processed, failed) {
        out.push_str("\n\n");
        out.push_str(&footer);
    }
    out
}

pub(crate) fn render_section(section: &DigestSection) -> String {
    let mut out = format!("## {}", section.topic);
    for bullet in &section.bullets {
        out.push_str("\n- ");
        out.push_str(bullet);
    }
    out
}
