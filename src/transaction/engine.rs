//! Transaction engine
//!
//! Runs a transaction's steps in order. Each step fans out to its target
//! nodes concurrently and is joined before the next step starts. A step
//! fails if any node fails; the engine then compensates:
//!
//! 1. the failed step's undo runs on the nodes where its do succeeded, or
//!    where the outcome is unknown (timeout, cancellation, transport error);
//! 2. every committed step's undo runs, newest first, on that step's nodes.
//!
//! Undo failures do not stop the unwind. They are returned together with the
//! error that caused the rollback.

use crate::common::{Error, NodeFailure, Result, TxnConfig};
use crate::peer::PeerStore;
use crate::transaction::context::TxnCtx;
use crate::transaction::lock::{self, LockManager};
use crate::transaction::rpc::{CtxWrites, StepExecutor, StepRequest, Transport};
use crate::transaction::step::{Node, NodeId, Step};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Cooperative cancellation for a running transaction
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this only returns on cancel
        let _ = rx.wait_for(|c| *c).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node results of one step dispatch
#[derive(Default)]
struct FanOut {
    succeeded: Vec<(NodeId, CtxWrites)>,
    failed: Vec<(NodeId, Error)>,
    /// Still outstanding when the step was interrupted
    abandoned: Vec<NodeId>,
    interrupted: Option<Error>,
}

impl FanOut {
    fn is_success(&self) -> bool {
        self.failed.is_empty() && self.interrupted.is_none()
    }

    /// Nodes that may carry the step's effect
    fn maybe_applied(&self) -> BTreeSet<NodeId> {
        self.succeeded
            .iter()
            .map(|(id, _)| *id)
            .chain(self.abandoned.iter().copied())
            .chain(
                self.failed
                    .iter()
                    .filter(|(_, e)| e.is_outcome_unknown())
                    .map(|(id, _)| *id),
            )
            .collect()
    }
}

/// Orchestrates transactions coordinated by this node
pub struct TxnEngine {
    node_id: NodeId,
    executor: Arc<StepExecutor>,
    transport: Arc<dyn Transport>,
    peers: PeerStore,
    locks: Arc<LockManager>,
    config: TxnConfig,
}

impl TxnEngine {
    pub fn new(
        executor: Arc<StepExecutor>,
        transport: Arc<dyn Transport>,
        peers: PeerStore,
        locks: Arc<LockManager>,
        config: TxnConfig,
    ) -> Self {
        Self {
            node_id: executor.node_id(),
            executor,
            transport,
            peers,
            locks,
            config,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Start a new transaction; `req_id` becomes its id for tracing
    pub fn new_txn(self: &Arc<Self>, req_id: Uuid) -> Txn {
        Txn {
            id: req_id,
            ctx: TxnCtx::new(req_id, self.node_id),
            steps: Vec::new(),
            nodes: None,
            engine: self.clone(),
            cancel: CancelToken::new(),
            timeout: self.config.txn_timeout(),
            executed: false,
            cleaned: false,
        }
    }

    async fn dispatch(&self, node: &Node, req: StepRequest) -> Result<CtxWrites> {
        // Local steps are direct calls, only RPCs get the RPC deadline
        if node.id == self.node_id {
            return self.executor.execute(req).await;
        }
        let step = req.step.clone();
        match tokio::time::timeout(self.config.rpc_timeout(), self.transport.dispatch(node, req))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{} on {}", step, node.id))),
        }
    }
}

/// One administrative operation: ordered steps plus a shared context
pub struct Txn {
    pub id: Uuid,
    pub ctx: TxnCtx,
    pub steps: Vec<Step>,
    /// Nodes the steps may target; `None` leaves targets unrestricted
    pub nodes: Option<BTreeSet<NodeId>>,
    engine: Arc<TxnEngine>,
    cancel: CancelToken,
    timeout: Duration,
    executed: bool,
    cleaned: bool,
}

impl Txn {
    /// Lock/unlock steps for `resource`, run on this coordinator
    pub fn lock_steps(&self, resource: &str) -> (Step, Step) {
        lock::lock_steps(&self.ctx, resource, self.engine.node_id)
    }

    /// Every node any step runs on
    pub fn targets(&self) -> BTreeSet<NodeId> {
        self.steps.iter().flat_map(|s| s.nodes.iter().copied()).collect()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Override the overall deadline (defaults to `txn_timeout_ms`)
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Run the transaction. Can be called once.
    pub async fn execute(&mut self) -> Result<()> {
        if self.executed {
            return Err(Error::InvalidTxn(format!("{} already executed", self.id)));
        }
        self.executed = true;
        let span = self.ctx.logger().clone();
        self.run().instrument(span).await
    }

    /// Release engine-held resources: leftover locks and the context
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        if let Err(e) = self.engine.locks.release_all(self.id) {
            tracing::warn!(txn_id = %self.id, error = %e, "Failed to release locks at cleanup");
        }
        self.ctx.clear();
    }

    fn resolve(&self) -> Result<HashMap<NodeId, Node>> {
        for step in &self.steps {
            if step.do_func.is_empty() {
                return Err(Error::InvalidTxn("step without a do function".into()));
            }
            if step.nodes.is_empty() {
                return Err(Error::InvalidTxn(format!(
                    "step {} has no target nodes",
                    step.do_func
                )));
            }
            if let Some(allowed) = &self.nodes {
                if let Some(outside) = step.nodes.iter().find(|n| !allowed.contains(n)) {
                    return Err(Error::InvalidTxn(format!(
                        "step {} targets {} outside the transaction's nodes",
                        step.do_func, outside
                    )));
                }
            }
        }

        let mut nodes = HashMap::new();
        for id in self.targets() {
            let node = if id == self.engine.node_id {
                Node {
                    id,
                    address: String::from("local"),
                }
            } else {
                self.engine
                    .peers
                    .get(id)?
                    .and_then(|p| p.node())
                    .ok_or_else(|| Error::PeerNotFound(id.to_string()))?
            };
            nodes.insert(id, node);
        }
        Ok(nodes)
    }

    async fn run(&self) -> Result<()> {
        let nodes = self.resolve()?;
        let deadline = Instant::now() + self.timeout;
        let mut committed: Vec<usize> = Vec::new();
        tracing::info!(steps = self.steps.len(), nodes = nodes.len(), "Transaction started");

        for (index, step) in self.steps.iter().enumerate() {
            tracing::debug!(step = %step.do_func, index, "Running step");
            let out = self
                .fan_out(&step.do_func, &step.targets(), &nodes, Some(deadline))
                .await;

            let committed_ok = out.is_success();
            let maybe_applied = out.maybe_applied();
            // Writes from nodes that finished are kept for their undo
            let mut succeeded = out.succeeded;
            succeeded.sort_by_key(|(id, _)| *id);
            for (_, writes) in succeeded {
                self.ctx.merge(writes);
            }

            if committed_ok {
                committed.push(index);
                continue;
            }

            for (node, e) in &out.failed {
                tracing::error!(step = %step.do_func, node = %node, error = %e, "Step failed on node");
            }
            let cause = match out.interrupted {
                Some(e) if out.failed.is_empty() => e,
                _ => step_error(step, out.failed),
            };
            return Err(self
                .rollback(step, &maybe_applied, &committed, &nodes, cause)
                .await);
        }

        tracing::info!("Transaction committed");
        Ok(())
    }

    async fn fan_out(
        &self,
        func: &str,
        targets: &BTreeSet<NodeId>,
        nodes: &HashMap<NodeId, Node>,
        deadline: Option<Instant>,
    ) -> FanOut {
        let mut pending: FuturesUnordered<_> = targets
            .iter()
            .filter_map(|id| nodes.get(id))
            .map(|node| {
                let req = StepRequest {
                    step: func.to_string(),
                    ctx: self.ctx.snapshot(),
                };
                async move { (node.id, self.engine.dispatch(node, req).await) }
            })
            .collect();

        let mut out = FanOut::default();
        let mut outstanding = targets.clone();
        loop {
            let next = match deadline {
                Some(deadline) => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        out.interrupted = Some(Error::Cancelled {
                            txn: self.id,
                            step: func.to_string(),
                        });
                        break;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        out.interrupted = Some(Error::Timeout(format!(
                            "transaction {} passed its deadline during {}",
                            self.id, func
                        )));
                        break;
                    }
                    next = pending.next() => next,
                },
                None => pending.next().await,
            };
            match next {
                Some((id, Ok(writes))) => {
                    outstanding.remove(&id);
                    out.succeeded.push((id, writes));
                }
                Some((id, Err(e))) => {
                    outstanding.remove(&id);
                    out.failed.push((id, e));
                }
                None => break,
            }
        }
        // Dropping `pending` abandons whatever is still in flight
        out.abandoned = outstanding.into_iter().collect();
        out
    }

    async fn rollback(
        &self,
        failed: &Step,
        failed_targets: &BTreeSet<NodeId>,
        committed: &[usize],
        nodes: &HashMap<NodeId, Node>,
        cause: Error,
    ) -> Error {
        tracing::warn!(cause = %cause, committed = committed.len(), "Rolling back transaction");
        let mut undo_failures = Vec::new();

        if failed.has_undo() && !failed_targets.is_empty() {
            self.undo(failed, failed_targets, nodes, &mut undo_failures)
                .await;
        }
        for &index in committed.iter().rev() {
            let step = &self.steps[index];
            if step.has_undo() {
                self.undo(step, &step.targets(), nodes, &mut undo_failures)
                    .await;
            }
        }

        if undo_failures.is_empty() {
            tracing::info!("Rollback complete");
            cause
        } else {
            tracing::error!(
                failures = undo_failures.len(),
                "Rollback incomplete; cluster state needs manual reconciliation"
            );
            Error::RollbackFailed {
                cause: Box::new(cause),
                undo_failures,
            }
        }
    }

    async fn undo(
        &self,
        step: &Step,
        targets: &BTreeSet<NodeId>,
        nodes: &HashMap<NodeId, Node>,
        failures: &mut Vec<NodeFailure>,
    ) {
        tracing::debug!(step = %step.undo_func, nodes = targets.len(), "Undoing step");
        // No deadline and no cancellation: compensation always runs to the end
        let out = self.fan_out(&step.undo_func, targets, nodes, None).await;
        for (node, e) in out.failed {
            tracing::error!(step = %step.undo_func, node = %node, error = %e, "Undo failed on node");
            failures.push(NodeFailure {
                node,
                error: format!("{}: {}", step.undo_func, e),
            });
        }
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("steps", &self.steps)
            .field("executed", &self.executed)
            .finish()
    }
}

/// A single-target step surfaces its node's error as is
fn step_error(step: &Step, mut failed: Vec<(NodeId, Error)>) -> Error {
    if failed.len() == 1 && step.targets().len() == 1 {
        if let Some((_, e)) = failed.pop() {
            return e;
        }
    }
    failed.sort_by_key(|(id, _)| *id);
    Error::StepFailed {
        step: step.do_func.clone(),
        failures: failed
            .into_iter()
            .map(|(node, e)| NodeFailure {
                node,
                error: e.to_string(),
            })
            .collect(),
    }
}
