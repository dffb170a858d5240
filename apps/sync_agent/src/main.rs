use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    config::{load_settings, normalize_database_url},
    SyncEngine, TokioScheduler,
};
use storage::Storage;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Keeps the local mutation queue flowing to the API and mirrors realtime
/// events into the local database until interrupted.
#[derive(Parser, Debug)]
struct Args {
    /// Settings file; `sync.toml` in the working directory is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    api_base_url: Option<String>,
    /// User announced on the realtime channel.
    #[arg(long)]
    user_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }
    if let Some(api_base_url) = args.api_base_url {
        settings.api_base_url = api_base_url;
    }
    if args.user_id.is_some() {
        settings.user_id = args.user_id;
    }
    settings.validate()?;

    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify the parent directory is writable"
        );
        error
    })?;

    let scheduler = Arc::new(TokioScheduler::default());
    let engine = SyncEngine::build(&settings, storage, scheduler.clone())?;
    engine.start(settings.user_id.clone()).await?;
    info!(
        api = %settings.api_base_url,
        database = %database_url,
        interval_secs = settings.sync_interval_secs,
        "sync agent running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.shutdown().await;
    scheduler.shutdown();

    let counts = engine.storage.queue_counts().await?;
    info!(
        pending = counts.pending,
        failed = counts.failed,
        "queue state at exit"
    );
    Ok(())
}
