// Stage 2: one aggregation request over all stage-1 summaries
use tracing::{debug, info, warn};

use crate::error::DigestError;
use crate::llm::{strip_code_fence, LlmProvider, LlmRequest};
use crate::model::{ArticleSummary, DigestResult, DigestSection};

/// Topic sections the digest is grouped into, in display order
pub const TOPICS: [&str; 6] = ["AI", "Semi", "Smartphone", "Other Tech", "World News", "Misc"];

const FALLBACK_TOPIC: &str = "Misc";

pub const STAGE2_SYSTEM_PROMPT: &str = "You are the editor of a news digest. \
You receive short summaries of recent articles, each with its title and link. \
Group them by topic using exactly these section headings, in this order, skipping empty ones: \
## AI, ## Semi, ## Smartphone, ## Other Tech, ## World News, ## Misc. \
Under each heading write one bullet per story starting with \"- \": a single concise sentence, \
followed by the source as a markdown link [source](url). \
Merge articles that cover the same story into one bullet with several links. \
Drop stories that were already covered in the previous digests provided. \
Output only the sections, with no title, preamble or closing remarks.";

fn build_prompt(successes: &[&ArticleSummary], history: &[String]) -> String {
    let mut prompt = String::new();

    if !history.is_empty() {
        prompt.push_str("Previous digests (do not repeat these stories):\n\n");
        for (i, previous) in history.iter().enumerate() {
            prompt.push_str(&format!("--- previous digest {} ---\n{}\n\n", i + 1, previous));
        }
        prompt.push_str("--- end of previous digests ---\n\n");
    }

    prompt.push_str(&format!("Article summaries ({}):\n\n", successes.len()));
    for (i, summary) in successes.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, summary.title));
        if let Some(feed) = &summary.feed {
            prompt.push_str(&format!("   Source: {}\n", feed));
        }
        prompt.push_str(&format!("   Link: {}\n", summary.link));
        prompt.push_str(&format!("   Summary: {}\n\n", summary.text().unwrap_or_default()));
    }
    prompt
}

/// Parse `## Topic` headings and `- ` bullets out of model output.
///
/// Returns `None` when no bullet could be found. Text before the first heading
/// is ignored unless it is a bullet, in which case it goes to `Misc`. Lines that
/// are neither headings nor bullets continue the previous bullet.
pub fn parse_sections(text: &str) -> Option<Vec<DigestSection>> {
    let mut sections: Vec<DigestSection> = Vec::new();
    let mut current: Option<usize> = None;

    for line in strip_code_fence(text).lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(topic) = heading(trimmed) {
            current = Some(section_index(&mut sections, topic));
            continue;
        }
        if trimmed.starts_with("# ") {
            // Title line; the digest carries its own
            continue;
        }

        if let Some(bullet) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
            .or_else(|| trimmed.strip_prefix("• "))
        {
            let bullet = bullet.trim();
            if bullet.is_empty() {
                continue;
            }
            let idx = match current {
                Some(idx) => idx,
                None => {
                    let idx = section_index(&mut sections, FALLBACK_TOPIC);
                    current = Some(idx);
                    idx
                }
            };
            sections[idx].bullets.push(bullet.to_string());
        } else if let Some(last) = current.and_then(|idx| sections[idx].bullets.last_mut()) {
            last.push(' ');
            last.push_str(trimmed);
        }
    }

    sections.retain(|s| !s.bullets.is_empty());
    if sections.is_empty() {
        None
    } else {
        Some(sections)
    }
}

fn heading(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("###").or_else(|| line.strip_prefix("##"))?;
    let topic = rest.trim().trim_matches('*').trim();
    if topic.is_empty() {
        None
    } else {
        Some(topic)
    }
}

/// Find or create the section for `topic`, matching known topics case-insensitively
fn section_index(sections: &mut Vec<DigestSection>, topic: &str) -> usize {
    let canonical = TOPICS
        .iter()
        .find(|known| known.eq_ignore_ascii_case(topic))
        .map(|known| known.to_string())
        .unwrap_or_else(|| topic.to_string());

    if let Some(idx) = sections.iter().position(|s| s.topic == canonical) {
        return idx;
    }
    sections.push(DigestSection {
        topic: canonical,
        bullets: Vec::new(),
    });
    sections.len() - 1
}

/// Aggregate stage-1 summaries into the final digest.
///
/// Failed summaries only count towards the tally. With no successful summary
/// the endpoint is not called and a "no content" digest is returned.
pub async fn aggregate<P: LlmProvider + ?Sized>(
    provider: &P,
    summaries: &[ArticleSummary],
    history: &[String],
) -> Result<DigestResult, DigestError> {
    let successes: Vec<&ArticleSummary> = summaries.iter().filter(|s| s.is_success()).collect();
    let failed = summaries.len() - successes.len();

    if successes.is_empty() {
        warn!(
            "Stage2: no successful summaries out of {}, skipping aggregation",
            summaries.len()
        );
        return Ok(DigestResult::no_content(summaries.len(), failed));
    }

    info!(
        "Stage2: aggregating {} summaries ({} failed, {} previous digests, model {})",
        successes.len(),
        failed,
        history.len(),
        provider.model()
    );

    let response = provider
        .generate(LlmRequest {
            system: Some(STAGE2_SYSTEM_PROMPT.to_string()),
            prompt: build_prompt(&successes, history),
            temperature: Some(0.4),
            ..LlmRequest::default()
        })
        .await
        .map_err(|e| DigestError::AggregationFailed(e.to_string()))?;

    debug!(
        tokens = response.usage.total_tokens,
        "Stage2 response: {:.150}",
        response.content
    );

    let sections = parse_sections(&response.content).ok_or_else(|| {
        DigestError::AggregationFailed("response contained no digest bullets".to_string())
    })?;

    let digest = DigestResult::new(sections, summaries.len(), failed);
    info!(
        "Digest generated: {} sections, {} characters",
        digest.sections.len(),
        digest.text.len()
    );
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, LlmResponse, UsageMetadata};
    use crate::model::Article;
    use chrono::Utc;
    use std::sync::Mutex;

    struct CannedProvider {
        reply: Result<String, ()>,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedProvider {
        fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for CannedProvider {
        fn model(&self) -> &str {
            "canned"
        }

        async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
            self.prompts.lock().unwrap().push(request.prompt);
            match &self.reply {
                Ok(text) => Ok(LlmResponse {
                    content: text.clone(),
                    usage: UsageMetadata::default(),
                    model: "canned".to_string(),
                }),
                Err(()) => Err(LlmError::Api {
                    status: 503,
                    body: "unavailable".to_string(),
                }),
            }
        }
    }

    fn article(id: i64) -> Article {
        Article {
            id,
            title: format!("Story {}", id),
            link: format!("https://example.com/{}", id),
            published_at: Utc::now(),
            content: String::new(),
            feed: Some("Wire".to_string()),
            category: None,
        }
    }

    fn three_with_one_failure() -> Vec<ArticleSummary> {
        vec![
            ArticleSummary::succeeded(&article(1), "First summary."),
            ArticleSummary::failed(&article(2), "LLM request timed out after 30s"),
            ArticleSummary::succeeded(&article(3), "Third summary."),
        ]
    }

    #[test]
    fn parse_groups_bullets_under_topics() {
        let text = "Here is your digest:\n\n## AI\n- Model released [Wire](https://a)\n  with more detail\n\n## world news\n* Summit held [Wire](https://b)\n";
        let sections = parse_sections(text).expect("sections");

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].topic, "AI");
        assert_eq!(sections[0].bullets, vec!["Model released [Wire](https://a) with more detail"]);
        assert_eq!(sections[1].topic, "World News");
        assert_eq!(sections[1].bullets.len(), 1);
    }

    #[test]
    fn parse_handles_fences_and_headless_bullets() {
        let text = "```markdown\n# Digest\n- orphan bullet\n## Semi\n- fab news\n## Smartphone\n```";
        let sections = parse_sections(text).expect("sections");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].topic, "Misc");
        assert_eq!(sections[1].topic, "Semi");
    }

    #[test]
    fn parse_rejects_text_without_bullets() {
        assert!(parse_sections("").is_none());
        assert!(parse_sections("   \n").is_none());
        assert!(parse_sections("## AI\nNothing to report today.").is_none());
    }

    #[tokio::test]
    async fn aggregates_successes_and_reports_failures() {
        let provider = CannedProvider::replying(
            "## AI\n- First story [Wire](https://example.com/1)\n## Misc\n- Third story [Wire](https://example.com/3)",
        );

        let digest = aggregate(&provider, &three_with_one_failure(), &[]).await.expect("digest");

        assert_eq!(provider.calls(), 1);
        let prompt = provider.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("Article summaries (2)"));
        assert!(prompt.contains("First summary."));
        assert!(!prompt.contains("Story 2"));

        assert_eq!(digest.processed, 3);
        assert_eq!(digest.failed, 1);
        assert_eq!(digest.sections.len(), 2);
        assert!(digest.text.contains("1 article failed"));
    }

    #[tokio::test]
    async fn history_is_included_in_prompt() {
        let provider = CannedProvider::replying("## AI\n- x");
        let history = vec!["# RSS Digest - old\n\n## AI\n- old story".to_string()];

        aggregate(&provider, &three_with_one_failure(), &history).await.unwrap();

        let prompt = provider.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("previous digest 1"));
        assert!(prompt.contains("old story"));
    }

    #[tokio::test]
    async fn no_successes_skips_the_endpoint() {
        let provider = CannedProvider::replying("## AI\n- x");
        let summaries = vec![
            ArticleSummary::failed(&article(1), "boom"),
            ArticleSummary::failed(&article(2), "boom"),
        ];

        let digest = aggregate(&provider, &summaries, &[]).await.unwrap();

        assert_eq!(provider.calls(), 0);
        assert!(digest.is_empty());
        assert_eq!(digest.processed, 2);
        assert_eq!(digest.failed, 2);

        let digest = aggregate(&provider, &[], &[]).await.unwrap();
        assert!(digest.is_empty());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn endpoint_error_is_aggregation_failure() {
        let provider = CannedProvider::failing();
        let err = aggregate(&provider, &three_with_one_failure(), &[]).await.unwrap_err();
        assert!(matches!(err, DigestError::AggregationFailed(ref msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn unstructured_reply_is_aggregation_failure() {
        let provider = CannedProvider::replying("I cannot help with that.");
        let err = aggregate(&provider, &three_with_one_failure(), &[]).await.unwrap_err();
        assert!(matches!(err, DigestError::AggregationFailed(_)));
    }
}
