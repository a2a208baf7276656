//! Peer command handlers

use crate::common::{Error, Result};
use crate::peer::store::{Peer, PeerStore};
use crate::transaction::{LockManager, Transport};
use crate::volume::VolumeStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Peer add request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddRequest {
    /// Defaults to the first address
    #[serde(default)]
    pub name: Option<String>,
    pub addresses: Vec<String>,
}

/// Lock serializing a peer's removal against volumes placing bricks on it
pub fn lock_name(id: Uuid) -> String {
    format!("peer/{}", id)
}

pub struct PeerCommands {
    local_id: Uuid,
    peers: PeerStore,
    volumes: VolumeStore,
    locks: Arc<LockManager>,
    transport: Arc<dyn Transport>,
    rpc_timeout: Duration,
}

impl PeerCommands {
    pub fn new(
        local_id: Uuid,
        peers: PeerStore,
        volumes: VolumeStore,
        locks: Arc<LockManager>,
        transport: Arc<dyn Transport>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            local_id,
            peers,
            volumes,
            locks,
            transport,
            rpc_timeout,
        }
    }

    /// Ask the daemon at the request's address who it is, then record it
    pub async fn add_peer(&self, req: PeerAddRequest) -> Result<Peer> {
        let address = req
            .addresses
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidRequest("no hostnames present".into()))?;
        let name = req.name.unwrap_or_else(|| address.clone());

        let identity = tokio::time::timeout(self.rpc_timeout, self.transport.identify(&address))
            .await
            .map_err(|_| Error::Timeout(format!("no answer from {}", address)))??;

        if identity.id == self.local_id {
            return Err(Error::PeerExists(format!("{} is this node", address)));
        }
        let peer = Peer {
            id: identity.id,
            name,
            addresses: req.addresses,
        };
        if !self.peers.create(&peer)? {
            return Err(Error::PeerExists(peer.id.to_string()));
        }

        tracing::info!(peer = %peer.id, name = %peer.name, address = %address, "Peer added");
        Ok(peer)
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        self.peers.list()
    }

    /// Remove a peer hosting no bricks
    ///
    /// Runs under the peer's lock, which volume create also takes for every
    /// node it places a brick on.
    pub async fn remove_peer(&self, id: Uuid) -> Result<()> {
        if id == self.local_id {
            return Err(Error::InvalidRequest("cannot remove this node".into()));
        }
        let owner = format!("peer-remove/{}", Uuid::new_v4());
        let _lock = self.locks.acquire(&lock_name(id), &owner).await?;

        let peer = self
            .peers
            .get(id)?
            .ok_or_else(|| Error::PeerNotFound(id.to_string()))?;

        let hosted: Vec<String> = self
            .volumes
            .list()?
            .into_iter()
            .filter(|v| v.bricks.iter().any(|b| b.node_id == id))
            .map(|v| v.name)
            .collect();
        if !hosted.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "peer {} hosts bricks of {}",
                peer.name,
                hosted.join(", ")
            )));
        }

        self.peers.delete(id)?;
        tracing::info!(peer = %id, name = %peer.name, "Peer removed");
        Ok(())
    }
}
