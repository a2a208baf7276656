//! Volume metadata in the cluster store
//!
//! Stores:
//! - Volume info (bricks, status, options) at `volumes/<name>`

use crate::common::store::{get_json, list_json, put_json, ClusterStore};
use crate::common::utils::encode_key;
use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

const VOLUME_PREFIX: &str = "volumes/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolStatus {
    Created,
    Started,
    Stopped,
}

impl std::fmt::Display for VolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolStatus::Created => write!(f, "created"),
            VolStatus::Started => write!(f, "started"),
            VolStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// One export directory of a volume, owned by one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Brick {
    pub node_id: Uuid,
    pub hostname: String,
    pub path: String,
    pub volume_name: String,
}

impl std::fmt::Display for Brick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.path)
    }
}

/// Volume info
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volinfo {
    pub id: Uuid,
    pub name: String,
    pub status: VolStatus,
    pub transport: String,
    pub replica_count: u32,
    pub bricks: Vec<Brick>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Volinfo {
    /// Nodes owning at least one brick, in id order
    pub fn nodes(&self) -> Vec<Uuid> {
        self.bricks
            .iter()
            .map(|b| b.node_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Bricks owned by `node`
    pub fn bricks_on(&self, node: Uuid) -> impl Iterator<Item = &Brick> {
        self.bricks.iter().filter(move |b| b.node_id == node)
    }
}

/// Volume registry
#[derive(Clone)]
pub struct VolumeStore {
    store: Arc<dyn ClusterStore>,
}

impl VolumeStore {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    fn key(name: &str) -> String {
        format!("{}{}", VOLUME_PREFIX, encode_key(name))
    }

    pub fn find(&self, name: &str) -> Result<Option<Volinfo>> {
        get_json(self.store.as_ref(), &Self::key(name))
    }

    /// Like `find`, but a missing volume is an error
    pub fn get(&self, name: &str) -> Result<Volinfo> {
        self.find(name)?
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.get(&Self::key(name))?.is_some())
    }

    pub fn put(&self, vol: &Volinfo) -> Result<()> {
        put_json(self.store.as_ref(), &Self::key(&vol.name), vol)
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        self.store.delete(&Self::key(name))
    }

    pub fn list(&self) -> Result<Vec<Volinfo>> {
        list_json(self.store.as_ref(), VOLUME_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::store::MemClusterStore;

    fn volinfo(name: &str, nodes: &[Uuid]) -> Volinfo {
        Volinfo {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: VolStatus::Created,
            transport: "tcp".into(),
            replica_count: 1,
            bricks: nodes
                .iter()
                .enumerate()
                .map(|(i, n)| Brick {
                    node_id: *n,
                    hostname: format!("n{}", i),
                    path: format!("/bricks/{}/b{}", name, i),
                    volume_name: name.to_string(),
                })
                .collect(),
            options: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_volume_registry() {
        let vols = VolumeStore::new(MemClusterStore::shared());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let vol = volinfo("vol1", &[a, b, a]);
        vols.put(&vol).unwrap();

        let back = vols.get("vol1").unwrap();
        assert_eq!(back, vol);
        assert_eq!(back.nodes().len(), 2);
        assert_eq!(back.bricks_on(a).count(), 2);
        assert!(vols.exists("vol1").unwrap());
        assert_eq!(vols.list().unwrap().len(), 1);

        assert!(matches!(vols.get("nope"), Err(Error::VolumeNotFound(_))));
        assert!(vols.delete("vol1").unwrap());
        assert!(vols.find("vol1").unwrap().is_none());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(VolStatus::Started.to_string(), "started");
        let brick = Brick {
            node_id: Uuid::nil(),
            hostname: "n1".into(),
            path: "/b1".into(),
            volume_name: "v".into(),
        };
        assert_eq!(brick.to_string(), "n1:/b1");
    }
}
