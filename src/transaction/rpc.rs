//! Step dispatch between nodes
//!
//! The coordinator sends `(step name, context snapshot)` to a node; the node
//! looks the name up in its own registry, runs it, and answers with the
//! context keys the step wrote. [`HttpTransport`] does this over JSON/HTTP,
//! [`InProcessTransport`] wires several daemons living in one process.

use crate::common::{Error, Result};
use crate::transaction::context::{CtxSnapshot, CtxValue, TxnCtx};
use crate::transaction::registry::StepRegistry;
use crate::transaction::step::{Node, NodeId};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

pub const STEP_PATH: &str = "/internal/v1/txn/step";
pub const IDENTITY_PATH: &str = "/internal/v1/identity";

/// Context keys written by a step, keyed by name
pub type CtxWrites = BTreeMap<String, CtxValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub step: String,
    pub ctx: CtxSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    NotRegistered,
    Failed,
}

/// Wire form of a step outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReply {
    #[serde(default)]
    pub writes: CtxWrites,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<(RemoteErrorKind, String)>,
}

impl StepReply {
    pub fn from_result(step: &str, result: Result<CtxWrites>) -> Self {
        match result {
            Ok(writes) => Self {
                writes,
                error: None,
            },
            Err(Error::StepNotRegistered(_)) => Self {
                writes: CtxWrites::new(),
                error: Some((RemoteErrorKind::NotRegistered, step.to_string())),
            },
            Err(e) => Self {
                writes: CtxWrites::new(),
                error: Some((RemoteErrorKind::Failed, e.to_string())),
            },
        }
    }

    pub fn into_result(self) -> Result<CtxWrites> {
        match self.error {
            None => Ok(self.writes),
            Some((RemoteErrorKind::NotRegistered, step)) => Err(Error::StepNotRegistered(step)),
            Some((RemoteErrorKind::Failed, msg)) => Err(Error::Other(msg)),
        }
    }
}

/// Who a daemon says it is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: Uuid,
    pub name: String,
}

/// Runs steps on this node from its registry
pub struct StepExecutor {
    node_id: NodeId,
    name: String,
    registry: Arc<StepRegistry>,
}

impl StepExecutor {
    pub fn new(node_id: NodeId, name: impl Into<String>, registry: Arc<StepRegistry>) -> Self {
        Self {
            node_id,
            name: name.into(),
            registry,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            id: self.node_id,
            name: self.name.clone(),
        }
    }

    /// Run a step against a snapshot, returning what it wrote
    pub async fn execute(&self, req: StepRequest) -> Result<CtxWrites> {
        let func = self
            .registry
            .lookup(&req.step)
            .ok_or_else(|| Error::StepNotRegistered(req.step.clone()))?;

        let ctx = TxnCtx::from_snapshot(req.ctx, self.node_id);
        let span = ctx.logger().clone();
        async {
            tracing::debug!(step = %req.step, "Executing step");
            func.call(ctx.clone())
                .await
                .inspect_err(|e| tracing::warn!(step = %req.step, error = %e, "Step failed"))?;
            Ok::<_, Error>(ctx.writes())
        }
        .instrument(span)
        .await
    }
}

/// Carries step dispatches to remote nodes
pub trait Transport: Send + Sync {
    fn dispatch<'a>(&'a self, node: &'a Node, req: StepRequest) -> BoxFuture<'a, Result<CtxWrites>>;

    /// Ask whatever daemon listens on `address` for its identity
    fn identify<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<NodeIdentity>>;
}

/// JSON over HTTP, served by the daemon's internal router
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(Self { client })
    }

    fn url(address: &str, path: &str) -> String {
        let base = address.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{}{}", base, path)
        } else {
            format!("http://{}{}", base, path)
        }
    }
}

impl Transport for HttpTransport {
    fn dispatch<'a>(&'a self, node: &'a Node, req: StepRequest) -> BoxFuture<'a, Result<CtxWrites>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(Self::url(&node.address, STEP_PATH))
                .json(&req)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Error::Http(format!(
                    "{} answered {}",
                    node.address,
                    resp.status()
                )));
            }
            let reply: StepReply = resp.json().await?;
            reply.into_result()
        })
    }

    fn identify<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<NodeIdentity>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(Self::url(address, IDENTITY_PATH))
                .send()
                .await?
                .error_for_status()?;
            Ok(resp.json().await?)
        })
    }
}

/// Transport between daemons sharing one process
///
/// Nodes can be marked unreachable to simulate a partition.
#[derive(Default)]
pub struct InProcessTransport {
    nodes: RwLock<HashMap<NodeId, (String, Arc<StepExecutor>)>>,
    unreachable: RwLock<HashSet<NodeId>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, address: impl Into<String>, executor: Arc<StepExecutor>) {
        self.nodes
            .write()
            .unwrap()
            .insert(executor.node_id(), (address.into(), executor));
    }

    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        let mut set = self.unreachable.write().unwrap();
        if unreachable {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    fn executor(&self, node: NodeId) -> Result<Arc<StepExecutor>> {
        if self.unreachable.read().unwrap().contains(&node) {
            return Err(Error::ConnectionFailed(format!("{} unreachable", node)));
        }
        self.nodes
            .read()
            .unwrap()
            .get(&node)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| Error::ConnectionFailed(format!("no route to {}", node)))
    }
}

impl Transport for InProcessTransport {
    fn dispatch<'a>(&'a self, node: &'a Node, req: StepRequest) -> BoxFuture<'a, Result<CtxWrites>> {
        Box::pin(async move {
            let executor = self.executor(node.id)?;
            let step = req.step.clone();
            // Same lossy error surface as the wire
            StepReply::from_result(&step, executor.execute(req).await).into_result()
        })
    }

    fn identify<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<NodeIdentity>> {
        Box::pin(async move {
            let found = self
                .nodes
                .read()
                .unwrap()
                .values()
                .find(|(addr, _)| addr == address)
                .map(|(_, e)| e.clone());
            match found {
                Some(e) => {
                    self.executor(e.node_id())?;
                    Ok(e.identity())
                }
                None => Err(Error::ConnectionFailed(format!("nothing listens on {}", address))),
            }
        })
    }
}
