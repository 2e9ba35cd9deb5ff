use std::sync::Arc;

use anyhow::Context;
use media_fetch::{
    AppState, Config, SqliteHistoryStore, YtDlpEngine, build_router,
    scratch::cleanup_stale_scratch,
};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() {
    if let Err(error) = dotenvy::dotenv()
        && !error.not_found()
    {
        eprintln!("Could not load .env: {error}");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_fetch=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tokio::fs::create_dir_all(&config.scratch_root)
        .await
        .with_context(|| format!("could not create scratch root {:?}", config.scratch_root))?;
    cleanup_stale_scratch(&config.scratch_root, config.stale_scratch_seconds).await;

    let history = SqliteHistoryStore::connect(&config.database_url)
        .await
        .with_context(|| format!("could not open history store {}", config.database_url))?;
    let engine = YtDlpEngine::new(config.yt_dlp_bin.clone(), config.yt_dlp_timeout);

    info!(
        "retry budget {} attempt(s), {} concurrent download(s), engine {}",
        config.max_download_retries, config.max_concurrent_downloads, config.yt_dlp_bin
    );

    let addr = config.bind_addr.clone();
    let app = build_router(AppState::new(config, Arc::new(engine), Arc::new(history)))?;

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;

    info!("Backend ready on http://{addr}");

    axum::serve(listener, app)
        .await
        .context("HTTP server error")
}
