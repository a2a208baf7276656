//! Peer metadata in the cluster store
//!
//! Stores one record per cluster member at `peers/<uuid>`.

use crate::common::store::{get_json, list_json, put_json, ClusterStore};
use crate::common::Result;
use crate::transaction::step::Node;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const PEER_PREFIX: &str = "peers/";

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: Uuid,
    pub name: String,
    pub addresses: Vec<String>,
}

impl Peer {
    /// Address the engine dials
    pub fn address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }

    pub fn node(&self) -> Option<Node> {
        self.address().map(|address| Node {
            id: self.id,
            address: address.to_string(),
        })
    }

    /// Does `host` name this peer, by peer name or by an address's host part?
    pub fn matches_host(&self, host: &str) -> bool {
        self.name == host || self.addresses.iter().any(|a| host_of(a) == host)
    }
}

/// `http://10.0.0.1:24007/` → `10.0.0.1`
fn host_of(address: &str) -> &str {
    let rest = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    let rest = rest.split('/').next().unwrap_or(rest);
    match rest.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => rest,
    }
}

/// Peer registry
#[derive(Clone)]
pub struct PeerStore {
    store: Arc<dyn ClusterStore>,
}

impl PeerStore {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    fn key(id: Uuid) -> String {
        format!("{}{}", PEER_PREFIX, id)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Peer>> {
        get_json(self.store.as_ref(), &Self::key(id))
    }

    /// Register or update a peer
    pub fn put(&self, peer: &Peer) -> Result<()> {
        put_json(self.store.as_ref(), &Self::key(peer.id), peer)
    }

    /// Insert a peer only if no record with its id exists
    pub fn create(&self, peer: &Peer) -> Result<bool> {
        let bytes = serde_json::to_vec(peer)
            .map_err(|e| crate::Error::Internal(format!("Serialize error: {}", e)))?;
        self.store
            .compare_and_swap(&Self::key(peer.id), None, bytes, None)
    }

    pub fn delete(&self, id: Uuid) -> Result<bool> {
        self.store.delete(&Self::key(id))
    }

    pub fn list(&self) -> Result<Vec<Peer>> {
        list_json(self.store.as_ref(), PEER_PREFIX)
    }

    pub fn find_by_host(&self, host: &str) -> Result<Option<Peer>> {
        Ok(self.list()?.into_iter().find(|p| p.matches_host(host)))
    }
}
