//! Daemon assembly
//!
//! Wires the cluster store, step registry, transport and brick runner into a
//! transaction engine plus the peer and volume command handlers, and serves
//! the internal RPC router.

use crate::common::store::ClusterStore;
use crate::common::{Config, Result};
use crate::daemon::http::create_router;
use crate::peer::{Peer, PeerCommands, PeerStore};
use crate::transaction::{LockManager, StepExecutor, StepRegistry, Transport, TxnEngine};
use crate::volume::{steps, BrickRunner, VolumeCommands, VolumeStore};
use axum::Router;
use std::sync::Arc;

pub struct Daemon {
    config: Config,
    executor: Arc<StepExecutor>,
    engine: Arc<TxnEngine>,
    volumes: VolumeCommands,
    peers: PeerCommands,
}

impl Daemon {
    /// Build a daemon, register its step functions on `registry` and record
    /// it as a peer in `store`
    ///
    /// Panics if `registry` already holds this daemon's step functions.
    pub fn new(
        config: Config,
        store: Arc<dyn ClusterStore>,
        registry: Arc<StepRegistry>,
        transport: Arc<dyn Transport>,
        bricks: Arc<dyn BrickRunner>,
    ) -> Result<Self> {
        config.validate()?;

        let locks = Arc::new(LockManager::new(store.clone(), &config.txn));
        locks.register_steps(&registry);
        steps::register_steps(&registry, bricks);

        let peer_store = PeerStore::new(store.clone());
        let volume_store = VolumeStore::new(store);
        steps::register_store_steps(&registry, volume_store.clone(), peer_store.clone());
        peer_store.put(&Peer {
            id: config.node_id,
            name: config.name.clone(),
            addresses: vec![config.advertised()],
        })?;

        let executor = Arc::new(StepExecutor::new(
            config.node_id,
            config.name.clone(),
            registry,
        ));
        let engine = Arc::new(TxnEngine::new(
            executor.clone(),
            transport.clone(),
            peer_store.clone(),
            locks.clone(),
            config.txn.clone(),
        ));
        let volumes = VolumeCommands::new(engine.clone(), volume_store.clone(), peer_store.clone());
        let peers = PeerCommands::new(
            config.node_id,
            peer_store,
            volume_store,
            locks,
            transport,
            config.txn.rpc_timeout(),
        );

        Ok(Self {
            config,
            executor,
            engine,
            volumes,
            peers,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    pub fn engine(&self) -> &Arc<TxnEngine> {
        &self.engine
    }

    pub fn volumes(&self) -> &VolumeCommands {
        &self.volumes
    }

    pub fn peers(&self) -> &PeerCommands {
        &self.peers
    }

    pub fn router(&self) -> Router {
        create_router(self.executor.clone())
    }

    /// Serve the internal RPC router until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting minigd: {} ({})", self.config.name, self.config.node_id);
        tracing::info!("  RPC API: {}", self.config.bind_addr);
        tracing::info!("  Advertised as: {}", self.config.advertised());

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let server = axum::serve(listener, self.router());

        tracing::info!("minigd ready");

        tokio::select! {
            res = server => {
                if let Err(e) = res {
                    tracing::error!("RPC server error: {}", e);
                    return Err(e.into());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
            }
        }

        Ok(())
    }
}
