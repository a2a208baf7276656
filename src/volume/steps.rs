//! Volume step functions
//!
//! Brick steps read the volume from the `volinfo` context key and act only
//! on the bricks owned by the node they run on. Undo functions are
//! idempotent and safe to run where the matching do never happened.
//!
//! The coordinator additionally runs two store steps while it holds the
//! volume's lock: `vol.CheckState` re-reads the volume and fails if another
//! transaction changed it since the command looked, and `vol.Store` writes
//! the outcome (undone by restoring the previous record).

use crate::common::{Error, Result};
use crate::peer::PeerStore;
use crate::transaction::{Json, StepRegistry, TxnCtx};
use crate::volume::bricks::BrickRunner;
use crate::volume::store::{Brick, VolStatus, Volinfo, VolumeStore};
use std::sync::Arc;

pub const VOLNAME_KEY: &str = "volname";
/// Volume as the command saw it; absent from the store for create
pub const VOLINFO_KEY: &str = "volinfo";
/// Record to store on success; absent means delete
pub const UPDATED_KEY: &str = "volinfo.updated";
pub const EXPECT_KEY: &str = "volinfo.expect";

pub const CHECK_STATE: &str = "vol.CheckState";
pub const STORE: &str = "vol.Store";
pub const STORE_UNDO: &str = "vol.StoreUndo";

pub const CREATE_PREPARE: &str = "vol-create.Prepare";
pub const CREATE_UNDO: &str = "vol-create.Undo";
pub const START_COMMIT: &str = "vol-start.Commit";
pub const START_UNDO: &str = "vol-start.Undo";
pub const STOP_COMMIT: &str = "vol-stop.Commit";
pub const STOP_UNDO: &str = "vol-stop.Undo";
pub const DELETE_COMMIT: &str = "vol-delete.Commit";

/// What the stored volume must look like once the lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Absent,
    NotStarted,
    Started,
}

impl Expect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Expect::Absent => "absent",
            Expect::NotStarted => "not-started",
            Expect::Started => "started",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "absent" => Ok(Expect::Absent),
            "not-started" => Ok(Expect::NotStarted),
            "started" => Ok(Expect::Started),
            other => Err(Error::Internal(format!("unknown volume expectation {:?}", other))),
        }
    }
}

/// Bricks of the context's volume owned by the executing node
fn local_bricks(ctx: &TxnCtx) -> Result<Vec<Brick>> {
    let Json(vol) = ctx.get::<Json<Volinfo>>(VOLINFO_KEY)?;
    Ok(vol
        .bricks
        .into_iter()
        .filter(|b| ctx.is_local(b.node_id))
        .collect())
}

/// Apply `op` to each brick; on failure, `revert` the ones already done
fn for_each_brick(
    bricks: &[Brick],
    op: impl Fn(&Brick) -> Result<()>,
    revert: impl Fn(&Brick) -> Result<()>,
) -> Result<()> {
    for (i, brick) in bricks.iter().enumerate() {
        if let Err(e) = op(brick) {
            for done in bricks[..i].iter().rev() {
                if let Err(re) = revert(done) {
                    tracing::warn!(brick = %done, error = %re, "Failed to revert brick");
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

fn prepare_bricks(ctx: &TxnCtx, runner: &dyn BrickRunner) -> Result<()> {
    let bricks = local_bricks(ctx)?;
    for brick in &bricks {
        tracing::info!(volume = %brick.volume_name, brick = %brick, "Preparing brick");
    }
    for_each_brick(&bricks, |b| runner.prepare(b), |b| runner.cleanup(b))
}

fn cleanup_bricks(ctx: &TxnCtx, runner: &dyn BrickRunner) -> Result<()> {
    for brick in local_bricks(ctx)? {
        tracing::info!(volume = %brick.volume_name, brick = %brick, "Releasing brick");
        runner.stop(&brick)?;
        runner.cleanup(&brick)?;
    }
    Ok(())
}

fn start_bricks(ctx: &TxnCtx, runner: &dyn BrickRunner) -> Result<()> {
    let bricks = local_bricks(ctx)?;
    for brick in &bricks {
        tracing::info!(volume = %brick.volume_name, brick = %brick, "Starting brick");
    }
    for_each_brick(&bricks, |b| runner.start(b), |b| runner.stop(b))
}

fn stop_bricks(ctx: &TxnCtx, runner: &dyn BrickRunner) -> Result<()> {
    for brick in local_bricks(ctx)? {
        tracing::info!(volume = %brick.volume_name, brick = %brick, "Stopping brick");
        runner.stop(&brick)?;
    }
    Ok(())
}

fn check_state(ctx: &TxnCtx, volumes: &VolumeStore, peers: &PeerStore) -> Result<()> {
    let name: String = ctx.get(VOLNAME_KEY)?;
    let expect = Expect::parse(&ctx.get::<String>(EXPECT_KEY)?)?;
    let Json(seen) = ctx.get::<Json<Volinfo>>(VOLINFO_KEY)?;

    let vol = match (expect, volumes.find(&name)?) {
        (Expect::Absent, Some(_)) => return Err(Error::VolumeExists(name)),
        (Expect::Absent, None) => {
            // Peer locks are held, so no brick host can leave from here on
            for node in seen.nodes() {
                if peers.get(node)?.is_none() {
                    return Err(Error::PeerNotFound(node.to_string()));
                }
            }
            return Ok(());
        }
        (_, None) => return Err(Error::VolumeNotFound(name)),
        (_, Some(vol)) => vol,
    };
    if vol.id != seen.id {
        return Err(Error::VolumeNotFound(format!("{} ({})", name, seen.id)));
    }
    match expect {
        Expect::NotStarted if vol.status == VolStatus::Started => Err(Error::VolumeInState {
            name,
            status: vol.status.to_string(),
        }),
        Expect::Started if vol.status != VolStatus::Started => Err(Error::VolumeNotStarted(name)),
        _ => Ok(()),
    }
}

fn store_volume(ctx: &TxnCtx, volumes: &VolumeStore) -> Result<()> {
    let name: String = ctx.get(VOLNAME_KEY)?;
    if ctx.contains(UPDATED_KEY) {
        let Json(vol) = ctx.get::<Json<Volinfo>>(UPDATED_KEY)?;
        volumes.put(&vol)
    } else {
        volumes.delete(&name)?;
        Ok(())
    }
}

fn restore_volume(ctx: &TxnCtx, volumes: &VolumeStore) -> Result<()> {
    let name: String = ctx.get(VOLNAME_KEY)?;
    match Expect::parse(&ctx.get::<String>(EXPECT_KEY)?)? {
        Expect::Absent => {
            volumes.delete(&name)?;
            Ok(())
        }
        _ => {
            let Json(vol) = ctx.get::<Json<Volinfo>>(VOLINFO_KEY)?;
            volumes.put(&vol)
        }
    }
}

/// Register the coordinator-side store steps on `registry`
pub fn register_store_steps(registry: &StepRegistry, volumes: VolumeStore, peers: PeerStore) {
    let (v, p) = (volumes.clone(), peers);
    registry.register(CHECK_STATE, move |ctx: TxnCtx| {
        let result = check_state(&ctx, &v, &p);
        async move { result }
    });
    let v = volumes.clone();
    registry.register(STORE, move |ctx: TxnCtx| {
        let result = store_volume(&ctx, &v);
        async move { result }
    });
    registry.register(STORE_UNDO, move |ctx: TxnCtx| {
        let result = restore_volume(&ctx, &volumes);
        async move { result }
    });
}

/// Register the volume step functions on `registry`
///
/// Brick operations touch the filesystem, so they run on the blocking pool.
pub fn register_steps(registry: &StepRegistry, runner: Arc<dyn BrickRunner>) {
    type Op = fn(&TxnCtx, &dyn BrickRunner) -> Result<()>;
    let table: [(&str, Op); 7] = [
        (CREATE_PREPARE, prepare_bricks),
        (CREATE_UNDO, cleanup_bricks),
        (START_COMMIT, start_bricks),
        (START_UNDO, stop_bricks),
        (STOP_COMMIT, stop_bricks),
        (STOP_UNDO, start_bricks),
        (DELETE_COMMIT, cleanup_bricks),
    ];
    for (name, op) in table {
        let runner = runner.clone();
        registry.register(name, move |ctx: TxnCtx| {
            let runner = runner.clone();
            async move {
                let span = ctx.logger().clone();
                tokio::task::spawn_blocking(move || span.in_scope(|| op(&ctx, runner.as_ref())))
                    .await
                    .map_err(|e| Error::Internal(format!("brick task failed: {}", e)))?
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::CtxValue;
    use crate::volume::bricks::LocalBrickRunner;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn volinfo(root: &std::path::Path, owners: &[Uuid]) -> Volinfo {
        Volinfo {
            id: Uuid::new_v4(),
            name: "vol1".into(),
            status: VolStatus::Created,
            transport: "tcp".into(),
            replica_count: 1,
            bricks: owners
                .iter()
                .enumerate()
                .map(|(i, n)| Brick {
                    node_id: *n,
                    hostname: format!("n{}", i),
                    path: root.join(format!("b{}", i)).to_string_lossy().into_owned(),
                    volume_name: "vol1".into(),
                })
                .collect(),
            options: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_steps_touch_only_local_bricks() {
        let dir = tempdir().unwrap();
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let vol = volinfo(dir.path(), &[me, other]);

        let runner = Arc::new(LocalBrickRunner::new());
        let registry = StepRegistry::new();
        register_steps(&registry, runner.clone());

        let ctx = TxnCtx::new(Uuid::new_v4(), me);
        ctx.set(VOLINFO_KEY, CtxValue::json(&vol).unwrap());

        registry.lookup(CREATE_PREPARE).unwrap().call(ctx.clone()).await.unwrap();
        registry.lookup(START_COMMIT).unwrap().call(ctx.clone()).await.unwrap();
        assert!(runner.is_running(&vol.bricks[0]));
        assert!(!runner.is_running(&vol.bricks[1]));
        assert!(!std::path::Path::new(&vol.bricks[1].path).exists());

        registry.lookup(START_UNDO).unwrap().call(ctx.clone()).await.unwrap();
        registry.lookup(START_UNDO).unwrap().call(ctx.clone()).await.unwrap();
        assert!(runner.running().is_empty());

        registry.lookup(DELETE_COMMIT).unwrap().call(ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_volinfo() {
        let registry = StepRegistry::new();
        register_steps(&registry, Arc::new(LocalBrickRunner::new()));
        let ctx = TxnCtx::new(Uuid::new_v4(), Uuid::new_v4());
        let err = registry.lookup(START_COMMIT).unwrap().call(ctx).await.unwrap_err();
        assert!(matches!(err, crate::Error::KeyNotFound(_)));
    }

    /// Runner whose start blocks its thread
    struct SlowStart;

    impl BrickRunner for SlowStart {
        fn prepare(&self, _brick: &Brick) -> Result<()> {
            Ok(())
        }
        fn cleanup(&self, _brick: &Brick) -> Result<()> {
            Ok(())
        }
        fn start(&self, _brick: &Brick) -> Result<()> {
            std::thread::sleep(std::time::Duration::from_millis(200));
            Ok(())
        }
        fn stop(&self, _brick: &Brick) -> Result<()> {
            Ok(())
        }
        fn is_running(&self, _brick: &Brick) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_brick_steps_leave_runtime_free() {
        let me = Uuid::new_v4();
        let vol = volinfo(std::path::Path::new("/bricks"), &[me]);
        let registry = StepRegistry::new();
        register_steps(&registry, Arc::new(SlowStart));
        let ctx = TxnCtx::new(Uuid::new_v4(), me);
        ctx.set(VOLINFO_KEY, CtxValue::json(&vol).unwrap());

        let step = async {
            registry.lookup(START_COMMIT).unwrap().call(ctx).await.unwrap();
            tokio::time::Instant::now()
        };
        let ticker = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tokio::time::Instant::now()
        };
        // Single-threaded runtime: the ticker only finishes first if the
        // brick call left the runtime thread
        let (step_done, tick_done) = tokio::join!(step, ticker);
        assert!(tick_done < step_done);
    }

    struct StoreFixture {
        registry: StepRegistry,
        volumes: VolumeStore,
        peers: PeerStore,
        me: Uuid,
    }

    fn store_fixture() -> StoreFixture {
        let store = crate::common::store::MemClusterStore::shared();
        let volumes = VolumeStore::new(store.clone());
        let peers = PeerStore::new(store);
        let registry = StepRegistry::new();
        register_store_steps(&registry, volumes.clone(), peers.clone());
        StoreFixture {
            registry,
            volumes,
            peers,
            me: Uuid::new_v4(),
        }
    }

    fn store_ctx(f: &StoreFixture, vol: &Volinfo, expect: Expect) -> TxnCtx {
        let ctx = TxnCtx::new(Uuid::new_v4(), f.me);
        ctx.set(VOLNAME_KEY, vol.name.as_str());
        ctx.set(VOLINFO_KEY, CtxValue::json(vol).unwrap());
        ctx.set(EXPECT_KEY, expect.as_str());
        ctx
    }

    async fn run(f: &StoreFixture, step: &str, ctx: &TxnCtx) -> crate::Result<()> {
        f.registry.lookup(step).unwrap().call(ctx.clone()).await
    }

    #[tokio::test]
    async fn test_check_state_for_create() {
        let f = store_fixture();
        let vol = volinfo(std::path::Path::new("/bricks"), &[f.me]);
        let ctx = store_ctx(&f, &vol, Expect::Absent);

        // Brick host left the cluster while the command waited
        assert!(matches!(
            run(&f, CHECK_STATE, &ctx).await,
            Err(Error::PeerNotFound(_))
        ));

        f.peers
            .put(&crate::peer::Peer {
                id: f.me,
                name: "n0".into(),
                addresses: vec!["mem://n0".into()],
            })
            .unwrap();
        run(&f, CHECK_STATE, &ctx).await.unwrap();

        f.volumes.put(&vol).unwrap();
        assert!(matches!(
            run(&f, CHECK_STATE, &ctx).await,
            Err(Error::VolumeExists(_))
        ));
    }

    #[tokio::test]
    async fn test_check_state_sees_fresh_status() {
        let f = store_fixture();
        let mut vol = volinfo(std::path::Path::new("/bricks"), &[f.me]);
        let start = store_ctx(&f, &vol, Expect::NotStarted);
        let stop = store_ctx(&f, &vol, Expect::Started);

        assert!(matches!(
            run(&f, CHECK_STATE, &start).await,
            Err(Error::VolumeNotFound(_))
        ));

        f.volumes.put(&vol).unwrap();
        run(&f, CHECK_STATE, &start).await.unwrap();
        assert!(matches!(
            run(&f, CHECK_STATE, &stop).await,
            Err(Error::VolumeNotStarted(_))
        ));

        // Started by someone else since the context was seeded
        vol.status = VolStatus::Started;
        f.volumes.put(&vol).unwrap();
        assert!(matches!(
            run(&f, CHECK_STATE, &start).await,
            Err(Error::VolumeInState { .. })
        ));
        run(&f, CHECK_STATE, &stop).await.unwrap();

        // Deleted and created again under the same name
        vol.id = Uuid::new_v4();
        f.volumes.put(&vol).unwrap();
        assert!(matches!(
            run(&f, CHECK_STATE, &stop).await,
            Err(Error::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_store_and_restore() {
        let f = store_fixture();
        let vol = volinfo(std::path::Path::new("/bricks"), &[f.me]);

        let create = store_ctx(&f, &vol, Expect::Absent);
        create.set(UPDATED_KEY, CtxValue::json(&vol).unwrap());
        run(&f, STORE, &create).await.unwrap();
        assert_eq!(f.volumes.get("vol1").unwrap(), vol);
        run(&f, STORE_UNDO, &create).await.unwrap();
        assert!(f.volumes.find("vol1").unwrap().is_none());

        f.volumes.put(&vol).unwrap();
        let started = Volinfo {
            status: VolStatus::Started,
            ..vol.clone()
        };
        let start = store_ctx(&f, &vol, Expect::NotStarted);
        start.set(UPDATED_KEY, CtxValue::json(&started).unwrap());
        run(&f, STORE, &start).await.unwrap();
        assert_eq!(f.volumes.get("vol1").unwrap().status, VolStatus::Started);
        run(&f, STORE_UNDO, &start).await.unwrap();
        assert_eq!(f.volumes.get("vol1").unwrap().status, VolStatus::Created);

        let delete = store_ctx(&f, &vol, Expect::NotStarted);
        run(&f, STORE, &delete).await.unwrap();
        assert!(f.volumes.find("vol1").unwrap().is_none());
        run(&f, STORE_UNDO, &delete).await.unwrap();
        assert_eq!(f.volumes.get("vol1").unwrap(), vol);
    }
}
