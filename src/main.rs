use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use tubedrop::config;
use tubedrop::convert::{ConversionRunner, locate_tool};
use tubedrop::router::{AppState, create_router};
use tubedrop::session::MemorySessionStore;
use ulid::Ulid;

fn ensure_work_dir(config: &config::Config) -> PathBuf {
    let work_dir = config.conversion.work_dir();

    // Ensure the directory exists
    if !work_dir.exists() {
        if let Err(e) = std::fs::create_dir_all(&work_dir) {
            tracing::error!("Failed to create work directory: {}", e);
        } else {
            tracing::debug!("Created work directory: {}", work_dir.display());
        }
    }

    work_dir
}

/// Sessions only live in memory, so scratch directories left over from a
/// previous run can never be downloaded anymore
fn purge_stale_scratch_dirs(work_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(work_dir) else {
        return;
    };

    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let is_scratch = path.is_dir()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.parse::<Ulid>().is_ok());

        if !is_scratch {
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => tracing::info!("Removed stale scratch directory {}", path.display()),
            Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    color_eyre::install()?;

    let config = config::config();

    let work_dir = ensure_work_dir(&config);
    purge_stale_scratch_dirs(&work_dir);

    match locate_tool(config.conversion.ytdlp_path.as_deref()) {
        Ok(path) => tracing::info!("Using yt-dlp at {}", path.display()),
        Err(e) => tracing::warn!("{} Conversions will fail until it is available.", e),
    }

    let sessions = Arc::new(MemorySessionStore::new(config.session.ttl()));
    tracing::info!(
        "Download links expire after {} seconds",
        sessions.ttl().as_secs()
    );
    let state = AppState::new(
        sessions,
        ConversionRunner::new(config.conversion.ytdlp_path.clone()),
        work_dir,
    );

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.host).await?;
    tracing::info!("Listening on: {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
