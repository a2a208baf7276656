//! Transaction context
//!
//! A per-transaction key/value bag shared by every step. Values are a small
//! tagged union ([`CtxValue`]); reads are checked decodes that fail with
//! `KeyNotFound` or `TypeMismatch` instead of panicking.
//!
//! The coordinator owns the authoritative context. Each dispatch carries a
//! [`CtxSnapshot`]; the keys a step writes on a node travel back in the reply
//! and are merged after the step's barrier, so later steps see them.

use crate::common::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::Span;
use uuid::Uuid;

/// Value shapes a context can hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CtxValue {
    Str(String),
    Id(Uuid),
    Int(i64),
    Bool(bool),
    List(Vec<String>),
    /// Small structs, JSON-encoded
    Json(serde_json::Value),
}

impl CtxValue {
    /// Encode a struct as a `Json` value
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(CtxValue::Json)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CtxValue::Str(_) => "string",
            CtxValue::Id(_) => "id",
            CtxValue::Int(_) => "int",
            CtxValue::Bool(_) => "bool",
            CtxValue::List(_) => "list",
            CtxValue::Json(_) => "json",
        }
    }
}

impl From<String> for CtxValue {
    fn from(v: String) -> Self {
        CtxValue::Str(v)
    }
}

impl From<&str> for CtxValue {
    fn from(v: &str) -> Self {
        CtxValue::Str(v.to_string())
    }
}

impl From<Uuid> for CtxValue {
    fn from(v: Uuid) -> Self {
        CtxValue::Id(v)
    }
}

impl From<i64> for CtxValue {
    fn from(v: i64) -> Self {
        CtxValue::Int(v)
    }
}

impl From<bool> for CtxValue {
    fn from(v: bool) -> Self {
        CtxValue::Bool(v)
    }
}

impl From<Vec<String>> for CtxValue {
    fn from(v: Vec<String>) -> Self {
        CtxValue::List(v)
    }
}

/// Types that can be read back out of a context
pub trait FromCtxValue: Sized {
    const EXPECTED: &'static str;

    fn from_ctx_value(value: &CtxValue) -> Option<Self>;
}

macro_rules! impl_from_ctx_value {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl FromCtxValue for $ty {
            const EXPECTED: &'static str = $name;

            fn from_ctx_value(value: &CtxValue) -> Option<Self> {
                match value {
                    CtxValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_from_ctx_value!(String, Str, "string");
impl_from_ctx_value!(Uuid, Id, "id");
impl_from_ctx_value!(i64, Int, "int");
impl_from_ctx_value!(bool, Bool, "bool");
impl_from_ctx_value!(Vec<String>, List, "list");

/// Wrapper for reading JSON-encoded structs, `ctx.get::<Json<Volinfo>>(..)`
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromCtxValue for Json<T> {
    const EXPECTED: &'static str = "json";

    fn from_ctx_value(value: &CtxValue) -> Option<Self> {
        match value {
            CtxValue::Json(v) => serde_json::from_value(v.clone()).ok().map(Json),
            _ => None,
        }
    }
}

/// Serialized form shipped with every step dispatch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CtxSnapshot {
    pub txn_id: Uuid,
    pub data: BTreeMap<String, CtxValue>,
}

#[derive(Default)]
struct CtxData {
    values: BTreeMap<String, CtxValue>,
    written: BTreeSet<String>,
}

struct CtxInner {
    txn_id: Uuid,
    node_id: Uuid,
    data: Mutex<CtxData>,
    span: Span,
}

/// Handle to a transaction context; clones share the same data
#[derive(Clone)]
pub struct TxnCtx {
    inner: Arc<CtxInner>,
}

impl TxnCtx {
    /// Fresh, empty context for a new transaction coordinated by `node_id`
    pub fn new(txn_id: Uuid, node_id: Uuid) -> Self {
        Self::with_values(txn_id, node_id, BTreeMap::new())
    }

    /// Rebuild a context on the node executing a step
    pub fn from_snapshot(snapshot: CtxSnapshot, node_id: Uuid) -> Self {
        Self::with_values(snapshot.txn_id, node_id, snapshot.data)
    }

    fn with_values(txn_id: Uuid, node_id: Uuid, values: BTreeMap<String, CtxValue>) -> Self {
        let span = tracing::info_span!("txn", txn_id = %txn_id, node = %node_id);
        Self {
            inner: Arc::new(CtxInner {
                txn_id,
                node_id,
                data: Mutex::new(CtxData {
                    values,
                    written: BTreeSet::new(),
                }),
                span,
            }),
        }
    }

    pub fn txn_id(&self) -> Uuid {
        self.inner.txn_id
    }

    /// Identifier of the node this context is executing on
    pub fn node_id(&self) -> Uuid {
        self.inner.node_id
    }

    /// Is `node` the node executing this step?
    pub fn is_local(&self, node: Uuid) -> bool {
        self.inner.node_id == node
    }

    /// Span tagged with the transaction id; use as `parent:` or instrument with it
    pub fn logger(&self) -> &Span {
        &self.inner.span
    }

    /// Set a value, overwriting any previous one
    pub fn set(&self, key: &str, value: impl Into<CtxValue>) {
        let mut data = self.inner.data.lock().unwrap();
        data.values.insert(key.to_string(), value.into());
        data.written.insert(key.to_string());
    }

    /// Checked read of a value
    pub fn get<T: FromCtxValue>(&self, key: &str) -> Result<T> {
        let data = self.inner.data.lock().unwrap();
        let value = data
            .values
            .get(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        T::from_ctx_value(value).ok_or_else(|| Error::TypeMismatch {
            key: key.to_string(),
            expected: T::EXPECTED,
            found: value.kind(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.data.lock().unwrap().values.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.data.lock().unwrap().values.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> CtxSnapshot {
        CtxSnapshot {
            txn_id: self.inner.txn_id,
            data: self.inner.data.lock().unwrap().values.clone(),
        }
    }

    /// Keys written through this handle since it was created, with their values
    pub fn writes(&self) -> BTreeMap<String, CtxValue> {
        let data = self.inner.data.lock().unwrap();
        data.written
            .iter()
            .filter_map(|k| data.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Apply writes made by a step on some node
    pub fn merge(&self, writes: BTreeMap<String, CtxValue>) {
        let mut data = self.inner.data.lock().unwrap();
        for (key, value) in writes {
            data.written.insert(key.clone());
            data.values.insert(key, value);
        }
    }

    /// Drop every value; the handle stays usable but empty
    pub(crate) fn clear(&self) {
        let mut data = self.inner.data.lock().unwrap();
        data.values.clear();
        data.written.clear();
    }
}

impl std::fmt::Debug for TxnCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnCtx")
            .field("txn_id", &self.inner.txn_id)
            .field("node_id", &self.inner.node_id)
            .field("keys", &self.keys())
            .finish()
    }
}
