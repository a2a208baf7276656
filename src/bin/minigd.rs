//! minigd daemon binary

use clap::{Parser, Subcommand};
use minigd::common::store::MemClusterStore;
use minigd::peer::PeerAddRequest;
use minigd::transaction::{HttpTransport, GLOBAL_REGISTRY};
use minigd::volume::LocalBrickRunner;
use minigd::{daemon::Daemon, Config};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "minigd")]
#[command(about = "minigd cluster management daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Serve {
        /// Node ID (stable UUID)
        #[arg(long)]
        id: Option<Uuid>,

        /// Peer name
        #[arg(long)]
        name: Option<String>,

        /// Bind address for the internal RPC server
        #[arg(long)]
        bind: Option<String>,

        /// Address peers use to reach this node
        #[arg(long)]
        advertise: Option<String>,

        /// Config file (defaults to ./minigd.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Peers to add once serving (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,
    },
}

/// Peers started together may not be listening yet
const JOIN_ATTEMPTS: u32 = 5;

async fn join_peer(daemon: &Daemon, address: &str) {
    for attempt in 1..=JOIN_ATTEMPTS {
        let req = PeerAddRequest {
            name: None,
            addresses: vec![address.to_string()],
        };
        match daemon.peers().add_peer(req).await {
            Ok(peer) => {
                tracing::info!(peer = %peer.id, "Joined {}", address);
                return;
            }
            Err(e) if e.is_retryable() && attempt < JOIN_ATTEMPTS => {
                tracing::debug!(error = %e, attempt, "Peer {} not reachable yet", address);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not add peer {}", address);
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            name,
            bind,
            advertise,
            config,
            peers,
        } => {
            // Load config from file and env, then override with CLI arguments
            let mut config = Config::load(config.as_deref())?;
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(name) = name {
                config.name = name;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind.parse()?;
            }
            if advertise.is_some() {
                config.advertise_addr = advertise;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.as_str().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let transport = Arc::new(HttpTransport::new(config.txn.rpc_timeout())?);
            let daemon = Daemon::new(
                config,
                MemClusterStore::shared(),
                GLOBAL_REGISTRY.clone(),
                transport,
                Arc::new(LocalBrickRunner::new()),
            )?;

            tracing::info!("minigd {}", minigd::BUILD_INFO);

            for address in peers {
                join_peer(&daemon, &address).await;
            }

            daemon.serve().await?;
        }
    }

    Ok(())
}
