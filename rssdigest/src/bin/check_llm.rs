use chrono::Utc;
use common::{env_lookup, FileConfig, PipelineConfig, RunFlags};
use rssdigest::llm::remote::RemoteLlmProvider;
use rssdigest::llm::LlmProvider;
use rssdigest::model::Article;
use rssdigest::summarizer::summarize_article;

/// Sends one stage-1 request to the configured endpoint and prints the reply.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    dotenv::dotenv().ok();
    let flags = RunFlags {
        send: false,
        ..RunFlags::default()
    };
    let file = FileConfig::load_with_defaults(Some(std::path::Path::new("rss-digest.toml")), None).await?;
    let config = PipelineConfig::resolve(file, env_lookup, flags)?;

    println!("\n{}", "=".repeat(60));
    println!("Testing LLM endpoint");
    println!("Base URL: {}", config.llm.base_url);
    println!("Stage-1 model: {}", config.llm.stage1_model);
    println!("Stage-2 model: {}", config.llm.stage2_model);
    println!("{}", "=".repeat(60));

    let provider = RemoteLlmProvider::new(
        &config.llm.base_url,
        &config.llm.api_key,
        &config.llm.stage1_model,
    )
    .with_defaults(config.llm.timeout, None, 0.7);

    let article = Article {
        id: 0,
        title: "Rust 1.70 released".to_string(),
        link: "https://blog.rust-lang.org/".to_string(),
        published_at: Utc::now(),
        content: r#"<p>Rust is a systems programming language that runs blazingly fast,
prevents segfaults, and guarantees thread safety. Version 1.70 stabilizes
OnceCell and OnceLock, and switches crates.io to the sparse index protocol
by default, which makes dependency resolution much faster.</p>"#
            .to_string(),
        feed: Some("Rust Blog".to_string()),
        category: Some("Tech".to_string()),
    };

    println!("\nSummarizing sample article with {}...", provider.model());
    let summary = summarize_article(&provider, &article).await;
    match (summary.text(), summary.error()) {
        (Some(text), _) => println!("✓ Success!\n  {}", text),
        (_, Some(err)) => eprintln!("✗ Failed: {}", err),
        _ => {}
    }

    println!("\n{}", "=".repeat(60));
    Ok(())
}
