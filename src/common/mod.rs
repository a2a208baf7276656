//! Common utilities and types shared across minigd

pub mod config;
pub mod error;
pub mod store;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, TxnConfig};
pub use error::{Error, NodeFailure, Result};
pub use store::{ClusterStore, MemClusterStore};
pub use utils::{encode_key, timestamp_now_millis};
