mod cli;
mod engine;
mod http;
mod metrics;
mod state;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands, RunArgs};
use engine::SyncEngine;
use http::router;
use state::AppState;
use statesync_core::{SourceHealth, StateStore, SyncPipeline};
use statesync_poll::{PollScheduler, RestFetcher};
use statesync_ws::{ChannelHandle, ChannelOptions, PushChannel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::CheckConfig(args) => {
            let config = args.to_sync_config().context("Invalid configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("ws_url = {}", config.ws_url()?);
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.config.to_sync_config().context("Invalid configuration")?;
    info!("Starting statesync");
    info!(
        "Backend: {}, sources: {}, HTTP: {}",
        config.backend_url,
        config.poll_sources.len(),
        args.http_addr
    );

    let metrics_handle = metrics::install_recorder()?;
    let store = Arc::new(StateStore::new(config.alert_capacity));

    // Poll sources
    let (scheduler, poll_events) = PollScheduler::new();
    let scheduler = Arc::new(scheduler);
    let fetcher = RestFetcher::new(Duration::from_millis(args.request_timeout_ms))
        .context("Failed to build HTTP client")?;
    for source in &config.poll_sources {
        store.register_source(SourceHealth::new(source.id.clone(), source.interval_ms));
        scheduler.register(
            source.id.clone(),
            source.interval(),
            fetcher.source(config.source_url(source)),
        );
    }

    // Push channel
    let (channel, channel_events) = if args.no_push {
        warn!("Push channel disabled, running poll-only");
        let (_, rx) = mpsc::unbounded_channel();
        (ChannelHandle::detached(), rx)
    } else {
        let url = config.ws_url()?;
        let options = ChannelOptions {
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
            user_id: config.user_id.clone(),
        };
        PushChannel::open(url, config.reconnect.policy(), options)
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let pipeline = SyncPipeline::new(config.router(), Arc::clone(&store));
    let engine = SyncEngine::new(
        pipeline,
        channel.clone(),
        Arc::clone(&scheduler),
        channel_events,
        poll_events,
        commands_rx,
    );
    let engine_handle = tokio::spawn(engine.run(shutdown_rx.clone()));

    scheduler.start();

    let state = AppState::new(
        Arc::clone(&store),
        channel.clone(),
        Arc::clone(&scheduler),
        commands_tx,
        Some(metrics_handle),
        shutdown_rx,
    );
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&args.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.http_addr))?;
    info!("HTTP server listening on http://{}", args.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("HTTP server failed")?;

    info!("Shutting down");
    scheduler.stop();
    channel.close();
    if let Err(e) = engine_handle.await {
        error!("Sync engine task failed: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
}
