pub mod clock;
pub mod commands;
pub mod config;
pub mod console;
pub mod error;
pub mod handoff;
pub mod identity;
pub mod slots;
pub mod state;
pub mod stats;
pub mod transport;

use config::TrackerConfig;
use console::ConsoleTransport;
use error::AppError;
use state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

/// Load config, open the stats file and serve the console until stdin closes.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), AppError> {
    // stdout carries the JSON event stream, so logs go to stderr
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let config = TrackerConfig::load(config_path.as_deref())?;
    tracing::info!(
        "Tracking {} slot(s), stats at {}",
        config.slots,
        config.stats_path.display()
    );

    let console = Arc::new(ConsoleTransport::stdout());
    let state = AppState::open(config, console.clone()).await?;
    let input = BufReader::new(tokio::io::stdin());
    console::run_console(state, console, input).await?;
    Ok(())
}
