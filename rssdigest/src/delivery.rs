use anyhow::{Context, Result};
use common::TelegramConfig;
use html_escape::{encode_double_quoted_attribute, encode_text};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::model::{render_section, DigestResult, DigestSection};

/// Telegram rejects messages longer than this (in characters)
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Topics sent in the first message; everything else goes in the second
pub const PART1_TOPICS: [&str; 3] = ["AI", "Semi", "Smartphone"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Html,
    Plain,
}

/// Anything that can push a text message to the digest's destination
#[async_trait::async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(&self, text: &str, mode: ParseMode) -> Result<()>;
}

/// What happened to the digest at the delivery step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Skipped(String),
    Sent { messages: usize },
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DeliveryOutcome::Failed(_))
    }
}

/// Telegram Bot API `sendMessage` client
pub struct TelegramSender {
    api_url: String,
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramSender {
    pub fn new(
        api_url: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            client,
        })
    }

    /// Build a sender when both the token and destination are configured
    pub fn from_config(config: &TelegramConfig, timeout: Duration) -> Result<Option<Self>> {
        match (&config.bot_token, &config.chat_id) {
            (Some(token), Some(chat_id)) => {
                Self::new(&config.api_url, token, chat_id, timeout).map(Some)
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait::async_trait]
impl Messenger for TelegramSender {
    async fn send_message(&self, text: &str, mode: ParseMode) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let body = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: match mode {
                ParseMode::Html => Some("HTML"),
                ParseMode::Plain => None,
            },
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Telegram request failed")?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let parsed: Option<TelegramResponse> = serde_json::from_str(&text).ok();

        match parsed {
            Some(r) if status.is_success() && r.ok => Ok(()),
            Some(r) => anyhow::bail!(
                "Telegram API error {}: {}",
                status,
                r.description.unwrap_or(text)
            ),
            None => anyhow::bail!("Telegram API error {}: {}", status, text),
        }
    }
}

/// Split the digest into the messages to send: one per topic group, each
/// titled, with ` (1/2)`/` (2/2)` markers only when both groups have content.
pub fn split_by_category(digest: &DigestResult) -> Vec<String> {
    let (part1, part2): (Vec<&DigestSection>, Vec<&DigestSection>) = digest
        .sections
        .iter()
        .partition(|s| PART1_TOPICS.contains(&s.topic.as_str()));

    if part1.is_empty() && part2.is_empty() {
        return vec![digest.text.clone()];
    }

    let title = digest.title();
    let both = !part1.is_empty() && !part2.is_empty();
    let mut parts = Vec::new();

    for (n, sections) in [(1, part1), (2, part2)] {
        if sections.is_empty() {
            continue;
        }
        let heading = if both {
            format!("{} ({}/2)", title, n)
        } else {
            title.clone()
        };
        let body: Vec<String> = sections.into_iter().map(render_section).collect();
        parts.push(format!("{}\n\n{}", heading, body.join("\n\n")));
    }

    if let (Some(footer), Some(last)) = (digest.footer(), parts.last_mut()) {
        last.push_str("\n\n");
        last.push_str(&footer);
    }
    parts
}

fn inline_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\*\*([^*]+)\*\*|\[([^\]]+)\]\(([^)\s]+)\)").expect("valid inline pattern")
    })
}

fn is_safe_url(raw: &str) -> bool {
    url::Url::parse(raw)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// `**bold**` and `[text](url)` to Telegram HTML; everything else escaped.
fn inline_html(text: &str) -> String {
    let mut out = String::new();
    let mut pos = 0;

    for caps in inline_pattern().captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&encode_text(&text[pos..whole.start()]));

        if let Some(bold) = caps.get(1) {
            out.push_str(&format!("<b>{}</b>", encode_text(bold.as_str())));
        } else if let (Some(label), Some(href)) = (caps.get(2), caps.get(3)) {
            if is_safe_url(href.as_str()) {
                out.push_str(&format!(
                    "<a href=\"{}\">{}</a>",
                    encode_double_quoted_attribute(href.as_str()),
                    encode_text(label.as_str())
                ));
            } else {
                warn!("Skipping unsafe URL: {:.50}", href.as_str());
                out.push_str(&encode_text(label.as_str()));
            }
        }
        pos = whole.end();
    }
    out.push_str(&encode_text(&text[pos..]));
    out
}

/// Convert digest markdown to the HTML subset Telegram accepts.
///
/// Conversion is line by line, so every tag opens and closes on one line.
pub fn markdown_to_telegram_html(markdown: &str) -> String {
    let lines: Vec<String> = markdown
        .lines()
        .map(|line| {
            let trimmed = line.trim();
            if let Some(heading) = trimmed
                .strip_prefix("### ")
                .or_else(|| trimmed.strip_prefix("## "))
                .or_else(|| trimmed.strip_prefix("# "))
            {
                format!("<b>{}</b>", inline_html(heading.trim()))
            } else if let Some(item) = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
            {
                format!("• {}", inline_html(item.trim()))
            } else if let Some(note) = trimmed
                .strip_prefix('_')
                .and_then(|rest| rest.strip_suffix('_'))
                .filter(|note| !note.is_empty())
            {
                format!("<i>{}</i>", inline_html(note))
            } else {
                inline_html(trimmed)
            }
        })
        .collect();
    lines.join("\n")
}

/// Split Telegram HTML into chunks of at most `limit` characters, preferring
/// line breaks. A line over the limit is cut between elements, never inside a
/// tag or an entity.
pub fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let needed = if current.is_empty() { line_len } else { line_len + 1 };

        if current_len + needed > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > limit {
            chunks.extend(split_html_line(line, limit));
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_html_line(line: &str, limit: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = line;
    while rest.chars().count() > limit {
        let (head, tail) = rest.split_at(html_cut_point(rest, limit));
        if !head.trim().is_empty() {
            pieces.push(head.trim_end().to_string());
        }
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Byte offset at which to cut `text` so the head holds at most `limit` chars.
///
/// Prefers the last space between elements, then any point between elements,
/// then any point outside a tag or entity; a hard cut is the last resort.
fn html_cut_point(text: &str, limit: usize) -> usize {
    let mut depth = 0usize;
    let mut in_tag = false;
    let mut closing = false;
    let mut in_entity = false;
    let (mut last_space, mut last_between, mut last_outside) = (None, None, None);

    for (n, (i, c)) in text.char_indices().enumerate() {
        if n > limit {
            break;
        }
        if n > 0 && !in_tag && !in_entity {
            last_outside = Some(i);
            if depth == 0 {
                last_between = Some(i);
                if c == ' ' {
                    last_space = Some(i);
                }
            }
        }

        if in_tag {
            if c == '>' {
                in_tag = false;
                depth = if closing { depth.saturating_sub(1) } else { depth + 1 };
            }
        } else if in_entity {
            in_entity = c != ';';
        } else if c == '<' {
            in_tag = true;
            closing = text[i + 1..].starts_with('/');
        } else if c == '&' {
            in_entity = true;
        }
    }

    last_space
        .or(last_between)
        .or(last_outside)
        .unwrap_or_else(|| {
            text.char_indices()
                .nth(limit.max(1))
                .map_or(text.len(), |(i, _)| i)
        })
}

/// Push the digest to the messenger.
///
/// Never touches the network when `send_enabled` is false or the digest has
/// no content. Stops at the first message that fails.
pub async fn deliver(
    digest: &DigestResult,
    messenger: Option<&dyn Messenger>,
    send_enabled: bool,
) -> DeliveryOutcome {
    if !send_enabled {
        info!("Delivery skipped (--no-send)");
        return DeliveryOutcome::Skipped("sending disabled".to_string());
    }
    if digest.is_empty() {
        info!("Delivery skipped: digest has no content");
        return DeliveryOutcome::Skipped("no content".to_string());
    }
    let Some(messenger) = messenger else {
        return DeliveryOutcome::Failed("no messaging destination configured".to_string());
    };

    let messages: Vec<String> = split_by_category(digest)
        .iter()
        .flat_map(|part| chunk_message(&markdown_to_telegram_html(part), TELEGRAM_MESSAGE_LIMIT))
        .collect();

    info!("Sending digest via Telegram ({} message(s))", messages.len());
    for (i, message) in messages.iter().enumerate() {
        if let Err(e) = messenger.send_message(message, ParseMode::Html).await {
            warn!("Failed to send message {}/{}: {:#}", i + 1, messages.len(), e);
            return DeliveryOutcome::Failed(format!(
                "message {}/{}: {:#}",
                i + 1,
                messages.len(),
                e
            ));
        }
    }

    info!("Digest sent successfully ({} message(s))", messages.len());
    DeliveryOutcome::Sent {
        messages: messages.len(),
    }
}
