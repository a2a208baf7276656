//! In-process cluster harness shared by the integration tests
#![allow(dead_code)]

use minigd::common::store::{ClusterStore, MemClusterStore};
use minigd::common::TxnConfig;
use minigd::transaction::{InProcessTransport, StepRegistry, TxnCtx, TxnEngine};
use minigd::volume::{Brick, BrickRunner};
use minigd::{Config, Daemon, Error, Result};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Brick runner that records what it was asked to do
#[derive(Default)]
pub struct RecordingBricks {
    events: Mutex<Vec<String>>,
    running: Mutex<HashSet<String>>,
    fail_start: AtomicBool,
    start_delay_ms: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingBricks {
    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make every start block its thread for `delay`
    pub fn set_start_delay(&self, delay: Duration) {
        self.start_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// `"<op> <path>"` in call order
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.split(' ').next() == Some(op))
            .count()
    }

    pub fn running(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Highest number of starts observed in flight at once
    pub fn max_concurrent_starts(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn record(&self, op: &str, brick: &Brick) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{} {}", op, brick.path));
    }
}

impl BrickRunner for RecordingBricks {
    fn prepare(&self, brick: &Brick) -> Result<()> {
        self.record("prepare", brick);
        Ok(())
    }

    fn cleanup(&self, brick: &Brick) -> Result<()> {
        self.record("cleanup", brick);
        Ok(())
    }

    fn start(&self, brick: &Brick) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            self.record("start-failed", brick);
            return Err(Error::Other(format!("brick {} exited on start", brick)));
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.running.lock().unwrap().insert(brick.path.clone());
        self.record("start", brick);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, brick: &Brick) -> Result<()> {
        self.running.lock().unwrap().remove(&brick.path);
        self.record("stop", brick);
        Ok(())
    }

    fn is_running(&self, brick: &Brick) -> bool {
        self.running.lock().unwrap().contains(&brick.path)
    }
}

pub struct TestNode {
    pub name: String,
    pub daemon: Daemon,
    pub registry: Arc<StepRegistry>,
    pub bricks: Arc<RecordingBricks>,
}

impl TestNode {
    pub fn id(&self) -> Uuid {
        self.daemon.config().node_id
    }
}

/// Daemons `n0..n{N-1}` sharing one cluster store; `n0` coordinates
pub struct Cluster {
    pub store: Arc<dyn ClusterStore>,
    pub transport: Arc<InProcessTransport>,
    pub nodes: Vec<TestNode>,
}

/// Timeouts short enough for tests
pub fn test_txn_config() -> TxnConfig {
    TxnConfig {
        rpc_timeout_ms: 2_000,
        lock_timeout_ms: 2_000,
        lock_ttl_ms: 3_000,
        txn_timeout_ms: 10_000,
    }
}

impl Cluster {
    pub fn new(size: usize) -> Self {
        Self::with_txn_config(size, test_txn_config())
    }

    pub fn with_txn_config(size: usize, txn: TxnConfig) -> Self {
        let store = MemClusterStore::shared();
        let transport = Arc::new(InProcessTransport::new());
        let nodes = (0..size)
            .map(|i| {
                let name = format!("n{}", i);
                let address = format!("mem://{}", name);
                let config = Config {
                    node_id: Uuid::new_v4(),
                    name: name.clone(),
                    advertise_addr: Some(address.clone()),
                    txn: txn.clone(),
                    ..Config::default()
                };
                let registry = Arc::new(StepRegistry::new());
                let bricks = Arc::new(RecordingBricks::default());
                let daemon = Daemon::new(
                    config,
                    store.clone(),
                    registry.clone(),
                    transport.clone(),
                    bricks.clone(),
                )
                .unwrap();
                transport.add_node(address, daemon.executor().clone());
                TestNode {
                    name,
                    daemon,
                    registry,
                    bricks,
                }
            })
            .collect();

        Self {
            store,
            transport,
            nodes,
        }
    }

    pub fn id(&self, index: usize) -> Uuid {
        self.nodes[index].id()
    }

    pub fn index_of(&self, id: Uuid) -> usize {
        self.nodes.iter().position(|n| n.id() == id).unwrap()
    }

    pub fn coordinator(&self) -> &Daemon {
        &self.nodes[0].daemon
    }

    pub fn engine(&self) -> &Arc<TxnEngine> {
        self.coordinator().engine()
    }

    /// Register the same step function on every node
    pub fn register_all<F, Fut>(&self, name: &str, func: F)
    where
        F: Fn(TxnCtx) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        for node in &self.nodes {
            node.registry.register(name, func.clone());
        }
    }
}

/// Shared record of `(label, node)` pairs written by test step functions
#[derive(Clone, Default)]
pub struct StepLog(Arc<Mutex<Vec<(String, Uuid)>>>);

impl StepLog {
    pub fn push(&self, label: &str, node: Uuid) {
        self.0.lock().unwrap().push((label.to_string(), node));
    }

    pub fn entries(&self) -> Vec<(String, Uuid)> {
        self.0.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries().into_iter().map(|(l, _)| l).collect()
    }

    /// Nodes that logged `label`, sorted
    pub fn nodes_for(&self, label: &str) -> Vec<Uuid> {
        let mut nodes: Vec<Uuid> = self
            .entries()
            .into_iter()
            .filter(|(l, _)| l == label)
            .map(|(_, n)| n)
            .collect();
        nodes.sort();
        nodes
    }
}

/// Register `label.do`/`label.undo` that log, with `label.do` failing on `fail_on`
pub fn register_logged_step(cluster: &Cluster, log: &StepLog, label: &str, fail_on: &[Uuid]) {
    let fail_on: Arc<HashSet<Uuid>> = Arc::new(fail_on.iter().copied().collect());
    let do_label = format!("{}.do", label);
    let undo_label = format!("{}.undo", label);

    let l = log.clone();
    let name = do_label.clone();
    cluster.register_all(&do_label, move |ctx: TxnCtx| {
        let l = l.clone();
        let name = name.clone();
        let fail_on = fail_on.clone();
        async move {
            l.push(&name, ctx.node_id());
            if fail_on.contains(&ctx.node_id()) {
                return Err(Error::Other(format!("{} refused on {}", name, ctx.node_id())));
            }
            Ok(())
        }
    });

    let l = log.clone();
    let name = undo_label.clone();
    cluster.register_all(&undo_label, move |ctx: TxnCtx| {
        let l = l.clone();
        let name = name.clone();
        async move {
            l.push(&name, ctx.node_id());
            Ok(())
        }
    });
}
