//! Scribebot CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scribebot")]
#[command(about = "Slack incident bot that keeps a live Google Doc report updated")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting scribebot");

    // Load configuration
    let config = if let Some(config_path) = cli.config {
        scribebot::config::Config::load_from_path(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        scribebot::config::Config::load().context("failed to load configuration")?
    };

    tracing::info!(instance_dir = %config.instance_dir.display(), "configuration loaded");

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .context("failed to build http client")?;

    // Google Docs backend
    let access_token = scribebot::docs::load_access_token(&http, &config.docs.token_path)
        .await
        .context("failed to obtain Google access token")?;
    let docs_client = scribebot::docs::GoogleDocsClient::new(http.clone(), access_token);
    let mutator = Arc::new(scribebot::docs::DocMutator::new(
        docs_client,
        config.docs.template_file_id.clone(),
        config.docs.incident_folder_id.clone(),
    ));

    // Model backend
    let completion = scribebot::llm::OpenAiClient::new(
        http,
        config.openai.api_key.clone(),
        config.openai.model.clone(),
        config.openai.temperature,
    );

    tracing::info!(model = %config.openai.model, "backends initialized");

    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<scribebot::InboundEvent>(256);
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<scribebot::OutboundNotice>(64);

    // Slack adapter
    let adapter = Arc::new(scribebot::slack::SlackAdapter::new(
        config.slack.bot_token.clone(),
        config.slack.app_token.clone(),
    ));

    let mut inbound = adapter
        .start()
        .await
        .context("failed to start slack adapter")?;

    // Forward inbound slack events to the scheduler
    tokio::spawn(async move {
        while let Some(event) = inbound.next().await {
            if event_tx.send(event).await.is_err() {
                tracing::warn!("scheduler gone, stopping slack event forwarding");
                break;
            }
        }
    });

    // Deliver scheduler notices (greetings) back to slack. A failed post is
    // fatal, like any other ingestion-path failure.
    let notice_adapter = adapter.clone();
    let notice_delivery = tokio::spawn(async move {
        while let Some(notice) = outbound_rx.recv().await {
            notice_adapter
                .post_message(&notice.channel, &notice.text)
                .await?;
        }
        Ok::<(), scribebot::Error>(())
    });

    let scheduler = scribebot::scheduler::Scheduler::new(
        completion,
        mutator,
        event_rx,
        outbound_tx,
        Duration::from_millis(config.sweep_interval_ms),
    );

    tokio::select! {
        result = scheduler.run() => {
            result.context("scheduler aborted")?;
        }
        result = notice_delivery => {
            result
                .context("notice delivery task panicked")?
                .context("failed to post channel notice")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    adapter.shutdown().await?;

    tracing::info!("scribebot stopped");
    Ok(())
}
