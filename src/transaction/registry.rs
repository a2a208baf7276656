//! Step function registry
//!
//! Maps step names to handlers. Remote dispatch addresses handlers by name,
//! so every daemon registers the same set at start-up. Registration is
//! write-once per name; a duplicate is a programming error and panics.

use crate::common::Result;
use crate::transaction::context::TxnCtx;
use futures_util::future::BoxFuture;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

pub type StepFuture = BoxFuture<'static, Result<()>>;

/// A function that can run as a transaction step
pub trait StepFunc: Send + Sync + 'static {
    fn call(&self, ctx: TxnCtx) -> StepFuture;
}

impl<F, Fut> StepFunc for F
where
    F: Fn(TxnCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, ctx: TxnCtx) -> StepFuture {
        Box::pin(self(ctx))
    }
}

/// Name → handler table
#[derive(Default)]
pub struct StepRegistry {
    funcs: RwLock<HashMap<String, Arc<dyn StepFunc>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`
    ///
    /// # Panics
    /// If `name` is already registered.
    pub fn register<F, Fut>(&self, name: &str, func: F)
    where
        F: Fn(TxnCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut funcs = self.funcs.write().unwrap();
        if funcs.contains_key(name) {
            panic!("step function {} registered twice", name);
        }
        funcs.insert(name.to_string(), Arc::new(func));
        tracing::debug!(step = name, "Registered step function");
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn StepFunc>> {
        self.funcs.read().unwrap().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.read().unwrap().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.funcs.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Process-wide registry used by the daemon binary
pub static GLOBAL_REGISTRY: Lazy<Arc<StepRegistry>> = Lazy::new(|| Arc::new(StepRegistry::new()));

/// Register into the process-wide registry
pub fn register_step_func<F, Fut>(name: &str, func: F)
where
    F: Fn(TxnCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    GLOBAL_REGISTRY.register(name, func);
}
