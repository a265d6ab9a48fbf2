//! pinstream server binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use pinstream::config::Config;
use pinstream::history::SledHistoryStore;
use pinstream::scraping::ChromiumFactory;
use pinstream::server::Server;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "pinstream")]
#[command(about = "Streams perceptually-unique scraped images to WebSocket clients")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(&cli.config)?;

    let browser_candidates = config.scraping.client_config().executables;
    if !browser_candidates.iter().any(|path| path.exists()) {
        anyhow::bail!(
            "no browser executable found; checked {:?}",
            browser_candidates
        );
    }

    let history = Arc::new(SledHistoryStore::open(&config.database.path)?);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let server = Server::new(
        config,
        history.clone(),
        Arc::new(ChromiumFactory),
        shutdown,
    );
    server.run().await?;

    history.flush()?;
    info!("shut down cleanly");
    Ok(())
}

/// Cancel the process scope on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("shutdown signal received");
        shutdown.cancel();
    });
}
