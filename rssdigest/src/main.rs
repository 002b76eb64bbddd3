/*
rssdigest - main.rs
Runs one digest: fetch recent FreshRSS entries, summarize them in two stages,
then save and/or send the result to Telegram.
*/

use anyhow::Context;
use clap::Parser;
use common::{env_lookup, FileConfig, OutputConfig, PipelineConfig, RunFlags, MAX_HOURS_BACK};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use rssdigest::delivery::DeliveryOutcome;
use rssdigest::{DigestError, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "rssdigest", about = "Summarize recent FreshRSS articles into a Telegram digest")]
struct Args {
    /// Hours to look back (overrides HOURS_BACK)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_HOURS_BACK)))]
    hours: Option<u32>,

    /// Build the digest but do not send it
    #[arg(long)]
    no_send: bool,

    /// Save the digest text under <log dir>/digests
    #[arg(long)]
    save: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Path to rss-digest.toml (defaults to ./rss-digest.toml when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// stderr plus an append-only log file; RUST_LOG overrides the level
fn init_logging(output: &OutputConfig, debug: bool) {
    let default_filter = if debug {
        "rssdigest=debug,common=debug,info"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let log_file = std::fs::create_dir_all(&output.log_dir).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(output.log_file())
    });

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);
    match log_file {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            warn!(%e, path = %output.log_file().display(), "log file unavailable, logging to stderr only");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // A .env file never overrides the real environment
    dotenv::dotenv().ok();

    if let Some(path) = &args.config {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
    }
    let default_path = PathBuf::from("rss-digest.toml");
    let file = FileConfig::load_with_defaults(Some(&default_path), args.config.as_deref())
        .await
        .context("failed to load configuration")?;

    let flags = RunFlags {
        hours: args.hours,
        send: !args.no_send,
        save: args.save,
        debug: args.debug,
    };
    let config = PipelineConfig::resolve(file, env_lookup, flags).map_err(DigestError::from)?;

    init_logging(&config.output, args.debug);
    info!(
        user = %config.source.username,
        hours = config.source.hours_back,
        stage1_model = %config.llm.stage1_model,
        stage2_model = %config.llm.stage2_model,
        workers = config.llm.max_workers,
        send = config.run.send,
        save = config.run.save,
        "configuration loaded"
    );

    let pipeline = Pipeline::from_config(config)?;

    // Ctrl-C abandons in-flight requests; nothing is persisted
    let result = tokio::select! {
        res = pipeline.run() => res,
        _ = tokio::signal::ctrl_c() => {
            warn!("ctrl-c received, abandoning run");
            Err(DigestError::Cancelled)
        }
    };

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!(%e, "digest run failed");
            return Err(e.into());
        }
    };

    if let Some(path) = &report.saved_to {
        info!(path = %path.display(), "digest written");
    }
    match &report.delivery {
        DeliveryOutcome::Sent { messages } => info!("digest delivered in {} message(s)", messages),
        DeliveryOutcome::Skipped(reason) => info!("delivery skipped: {}", reason),
        DeliveryOutcome::Failed(detail) => error!("delivery failed: {}", detail),
    }

    if report.articles_found == 0 {
        info!("no new articles");
    } else {
        info!(
            articles = report.articles_found,
            failed = report.digest.failed,
            sections = report.digest.sections.len(),
            "run complete"
        );
    }
    if !report.is_success() {
        if let DeliveryOutcome::Failed(detail) = report.delivery {
            return Err(DigestError::DeliveryFailed(detail).into());
        }
    }
    if !pipeline.config().run.send && !report.digest.is_empty() && report.saved_to.is_none() {
        // Nothing sent or saved: show the digest rather than dropping it
        println!("{}", report.digest.text);
    }
    Ok(())
}
