//! Volume command handlers
//!
//! Each mutating command checks its preconditions, then runs a transaction
//! over the volume's nodes. Once the lock is held the coordinator checks the
//! stored volume again, and the new state is written inside the transaction,
//! before the lock is released, so a queued command never acts on what it
//! read before it got the lock.

use crate::common::{Error, Result};
use crate::peer::{self, PeerStore};
use crate::transaction::{CtxValue, Step, Txn, TxnEngine};
use crate::volume::steps::{self, Expect, EXPECT_KEY, UPDATED_KEY, VOLINFO_KEY, VOLNAME_KEY};
use crate::volume::store::{Brick, VolStatus, Volinfo, VolumeStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use uuid::Uuid;

fn default_transport() -> String {
    String::from("tcp")
}

fn default_replica_count() -> u32 {
    1
}

/// Volume create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolCreateRequest {
    pub name: String,
    /// `host:/path` entries, host being a peer name or address
    pub bricks: Vec<String>,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_replica_count")]
    pub replica_count: u32,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl VolCreateRequest {
    pub fn new(name: impl Into<String>, bricks: Vec<String>) -> Self {
        Self {
            name: name.into(),
            bricks,
            transport: default_transport(),
            replica_count: default_replica_count(),
            options: BTreeMap::new(),
        }
    }
}

/// Volume names end up in keys and brick markers
fn validate_volname(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::InvalidRequest(format!("invalid volume name {:?}", name)));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidRequest(format!(
            "volume name {:?} may only contain letters, digits, '-' and '_'",
            name
        )));
    }
    Ok(())
}

/// `host:/path` → (host, path)
fn parse_brick(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once(':') {
        Some((host, path)) if !host.is_empty() && path.starts_with('/') => Ok((host, path)),
        _ => Err(Error::InvalidRequest(format!(
            "brick {:?} is not of the form host:/path",
            spec
        ))),
    }
}

pub struct VolumeCommands {
    engine: Arc<TxnEngine>,
    volumes: VolumeStore,
    peers: PeerStore,
}

impl VolumeCommands {
    pub fn new(engine: Arc<TxnEngine>, volumes: VolumeStore, peers: PeerStore) -> Self {
        Self {
            engine,
            volumes,
            peers,
        }
    }

    pub fn list(&self) -> Result<Vec<Volinfo>> {
        self.volumes.list()
    }

    pub fn info(&self, name: &str) -> Result<Volinfo> {
        self.volumes.get(name)
    }

    pub async fn create(&self, req: VolCreateRequest) -> Result<Volinfo> {
        validate_volname(&req.name)?;
        if req.bricks.is_empty() {
            return Err(Error::InvalidRequest("no bricks given".into()));
        }
        if req.replica_count == 0 || req.bricks.len() % req.replica_count as usize != 0 {
            return Err(Error::InvalidRequest(format!(
                "{} bricks cannot form replica sets of {}",
                req.bricks.len(),
                req.replica_count
            )));
        }
        if self.volumes.exists(&req.name)? {
            return Err(Error::VolumeExists(req.name));
        }

        let mut seen = HashSet::new();
        let mut bricks = Vec::with_capacity(req.bricks.len());
        for spec in &req.bricks {
            let (host, path) = parse_brick(spec)?;
            let peer = self
                .peers
                .find_by_host(host)?
                .ok_or_else(|| Error::PeerNotFound(host.to_string()))?;
            if !seen.insert((peer.id, path.to_string())) {
                return Err(Error::InvalidRequest(format!("brick {} given twice", spec)));
            }
            bricks.push(Brick {
                node_id: peer.id,
                hostname: host.to_string(),
                path: path.to_string(),
                volume_name: req.name.clone(),
            });
        }

        let vol = Volinfo {
            id: Uuid::new_v4(),
            name: req.name,
            status: VolStatus::Created,
            transport: req.transport,
            replica_count: req.replica_count,
            bricks,
            options: req.options,
            created_at: Utc::now(),
        };

        let step = Step::new(steps::CREATE_PREPARE, vol.nodes()).with_undo(steps::CREATE_UNDO);
        let peer_locks: Vec<String> = vol.nodes().into_iter().map(peer::lock_name).collect();
        let mut txn = self.txn(&vol, Expect::Absent, Some(&vol), step, &peer_locks)?;
        self.run(&mut txn, &vol, "create").await?;
        tracing::info!(volume = %vol.name, bricks = vol.bricks.len(), "Volume created");
        Ok(vol)
    }

    pub async fn start(&self, name: &str) -> Result<Volinfo> {
        let vol = self.volumes.get(name)?;
        if vol.status == VolStatus::Started {
            return Err(Error::VolumeInState {
                name: vol.name,
                status: vol.status.to_string(),
            });
        }

        let started = Volinfo {
            status: VolStatus::Started,
            ..vol.clone()
        };
        let step = Step::new(steps::START_COMMIT, vol.nodes()).with_undo(steps::START_UNDO);
        let mut txn = self.txn(&vol, Expect::NotStarted, Some(&started), step, &[])?;
        self.run(&mut txn, &vol, "start").await?;
        tracing::info!(volume = %vol.name, "Volume started");
        Ok(started)
    }

    pub async fn stop(&self, name: &str) -> Result<Volinfo> {
        let vol = self.volumes.get(name)?;
        if vol.status != VolStatus::Started {
            return Err(Error::VolumeNotStarted(vol.name));
        }

        let stopped = Volinfo {
            status: VolStatus::Stopped,
            ..vol.clone()
        };
        let step = Step::new(steps::STOP_COMMIT, vol.nodes()).with_undo(steps::STOP_UNDO);
        let mut txn = self.txn(&vol, Expect::Started, Some(&stopped), step, &[])?;
        self.run(&mut txn, &vol, "stop").await?;
        tracing::info!(volume = %vol.name, "Volume stopped");
        Ok(stopped)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let vol = self.volumes.get(name)?;
        if vol.status == VolStatus::Started {
            return Err(Error::VolumeInState {
                name: vol.name,
                status: vol.status.to_string(),
            });
        }

        let step = Step::new(steps::DELETE_COMMIT, vol.nodes());
        let mut txn = self.txn(&vol, Expect::NotStarted, None, step, &[])?;
        self.run(&mut txn, &vol, "delete").await?;
        tracing::info!(volume = %vol.name, "Volume deleted");
        Ok(())
    }

    /// lock → check → `step` → store → unlock
    ///
    /// The check re-reads the volume under the lock and expects `expect`;
    /// the store step writes `updated`, or deletes the volume when `None`.
    fn txn(
        &self,
        vol: &Volinfo,
        expect: Expect,
        updated: Option<&Volinfo>,
        step: Step,
        extra_locks: &[String],
    ) -> Result<Txn> {
        let coordinator = self.engine.node_id();
        let mut txn = self.engine.new_txn(Uuid::new_v4());
        let (lock, unlock) = txn.lock_steps(&vol.name);
        for name in extra_locks {
            // Joins the same lock step
            let _ = txn.lock_steps(name);
        }

        txn.ctx.set(VOLNAME_KEY, vol.name.as_str());
        txn.ctx.set(VOLINFO_KEY, CtxValue::json(vol)?);
        txn.ctx.set(EXPECT_KEY, expect.as_str());
        if let Some(updated) = updated {
            txn.ctx.set(UPDATED_KEY, CtxValue::json(updated)?);
        }

        let mut nodes: BTreeSet<Uuid> = vol.nodes().into_iter().collect();
        nodes.insert(coordinator);
        txn.nodes = Some(nodes);
        txn.steps = vec![
            lock,
            Step::new(steps::CHECK_STATE, vec![coordinator]),
            step,
            Step::new(steps::STORE, vec![coordinator]).with_undo(steps::STORE_UNDO),
            unlock,
        ];
        Ok(txn)
    }

    async fn run(&self, txn: &mut Txn, vol: &Volinfo, op: &str) -> Result<()> {
        let result = txn.execute().await;
        txn.cleanup();
        result.inspect_err(|e| {
            tracing::error!(volume = %vol.name, txn_id = %txn.id, error = %e, "Failed to {} volume", op)
        })
    }
}
