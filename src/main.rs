//! bboard -- replicated bulletin board server.
//!
//! Loads the YAML configuration, applies command-line overrides, starts
//! the server, and then waits on signals: SIGHUP reloads the
//! configuration from disk, SIGINT/SIGTERM shut down gracefully.

use clap::Parser;
use tracing::info;

use bboard::config::{self, Config};

/// Command-line arguments for the bulletin board server.
#[derive(Parser, Debug)]
#[command(name = "bboard", version, about = "Replicated bulletin board server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "bboard.example.yaml")]
    config: String,

    /// Override the bulletin store file path.
    #[arg(short = 'b', long)]
    store: Option<String>,

    /// Override the bulletin protocol port.
    #[arg(short = 'p', long)]
    bbport: Option<u16>,

    /// Override the synchronization port.
    #[arg(short = 's', long)]
    syncport: Option<u16>,

    /// Override the worker pool size.
    #[arg(short = 'T', long)]
    workers: Option<usize>,

    /// Enable debug mode: verbose logging and slowed store I/O.
    #[arg(short, long)]
    debug: bool,

    /// Peer addresses (host:port) replacing the configured peer list.
    peers: Vec<String>,
}

impl Cli {
    /// Fold the command-line overrides into the loaded configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(store) = &self.store {
            config.store.path = store.clone();
        }
        if let Some(bbport) = self.bbport {
            config.server.bbport = bbport;
        }
        if let Some(syncport) = self.syncport {
            config.server.syncport = syncport;
        }
        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }
        if self.debug {
            config.debug = true;
        }
        if !self.peers.is_empty() {
            config.cluster.peers = self.peers.clone();
        }
    }
}

fn load(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = config::load_config(&cli.config)?;
    cli.apply(&mut config);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load(&cli)?;

    let default_level = if config.debug {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    info!("loaded configuration from {}", cli.config);
    let mut server = bboard::server::start(config).await?;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    server.stop().await?;
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    server.stop().await?;
                    break;
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP, reloading configuration");
                    let config = load(&cli)?;
                    server = server.reload(config).await?;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received interrupt, shutting down");
        server.stop().await?;
    }

    info!("bboard shut down");
    Ok(())
}
