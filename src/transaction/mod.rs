//! Distributed transactions
//!
//! An administrative operation is expressed as a [`Txn`]: an ordered list of
//! [`Step`]s, each naming a registered step function and the nodes it runs
//! on, plus a shared [`TxnCtx`]. The [`TxnEngine`] runs the steps in order,
//! fans each one out to its nodes, and compensates with the steps' undo
//! functions when anything fails.
//!
//! ```text
//!   lock ──▶ domain step(s) ──▶ unlock
//!    │            │ fan-out to nodes, barrier
//!    ▼            ▼
//!  undo ◀──── undo (reverse order on failure)
//! ```

pub mod context;
pub mod engine;
pub mod lock;
pub mod registry;
pub mod rpc;
pub mod step;

pub use context::{CtxSnapshot, CtxValue, FromCtxValue, Json, TxnCtx};
pub use engine::{CancelToken, Txn, TxnEngine};
pub use lock::{lock_steps, DistributedLock, LockHandle, LockManager};
pub use registry::{register_step_func, StepFunc, StepRegistry, GLOBAL_REGISTRY};
pub use rpc::{HttpTransport, InProcessTransport, NodeIdentity, StepExecutor, Transport};
pub use step::{Node, NodeId, Step};
