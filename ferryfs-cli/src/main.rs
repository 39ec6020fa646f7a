//! FerryFS demo daemon.
//!
//! Serves the in-memory filesystem over a unix socket; peers speak the
//! engine's framed wire protocol. Intended for protocol experiments and
//! as a reference embedding of the engine.

mod memfs;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ferryfs::{EngineConfig, Mount, PathMode};
use memfs::MemFs;

#[derive(Parser, Debug)]
#[command(
    name = "ferryfs",
    version,
    about = "Serve an in-memory filesystem over a unix socket"
)]
struct Cli {
    /// Unix socket to listen on (default: runtime dir, else temp dir).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Engine configuration file (INI).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disable cached-path bookkeeping.
    #[arg(long)]
    no_paths: bool,
}

fn default_socket() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ferryfs.sock")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!(error = %e, "daemon failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if cli.no_paths {
        config = config.with_path_mode(PathMode::Off);
    }

    let socket = cli.socket.unwrap_or_else(default_socket);
    if socket.exists() {
        // Stale socket from a previous run.
        std::fs::remove_file(&socket)?;
    }
    let listener = UnixListener::bind(&socket)?;
    info!(socket = %socket.display(), "listening");

    let mount = Arc::new(Mount::new(MemFs::new(), config).await?);

    loop {
        if mount.lifecycle().is_dead() {
            info!("filesystem unmounted, shutting down");
            break;
        }
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                info!("peer connected");
                let mount = mount.clone();
                tokio::spawn(async move {
                    if let Err(e) = mount.serve(stream).await {
                        warn!(error = %e, "serve loop failed");
                    }
                    info!("peer disconnected");
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&socket);
    Ok(())
}
