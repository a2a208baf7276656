//! # minigd
//!
//! A cluster management daemon for distributed storage. Administrative
//! operations that touch several nodes run as distributed transactions:
//! - Ordered steps dispatched to their nodes by registered name
//! - A shared, typed transaction context propagated between steps
//! - Lease-backed distributed locks serializing work per resource
//! - Reverse-order compensation when any step fails
//!
//! ## Architecture
//!
//! ```text
//!            admin command (volume start, peer add, ...)
//!                          │
//! ┌────────────────────────▼────────────────────────┐
//! │ Coordinator daemon: TxnEngine                   │
//! │   lock ─▶ step ─▶ ... ─▶ unlock                 │
//! │   rollback: undo in reverse order               │
//! └──────┬────────────────────┬───────────────┬─────┘
//!        │ local call         │ JSON/HTTP     │ JSON/HTTP
//!   ┌────▼─────┐        ┌─────▼────┐    ┌─────▼────┐
//!   │ Node 1   │        │ Node 2   │    │ Node 3   │
//!   │ registry │        │ registry │    │ registry │
//!   └──────────┘        └──────────┘    └──────────┘
//!        cluster store: peers/, volumes/, locks/
//! ```
//!
//! ## Usage
//!
//! ```bash
//! minigd serve \
//!   --id 6f1d2c4e-8a7b-4c3d-9e0f-112233445566 \
//!   --bind 0.0.0.0:24007 \
//!   --config ./minigd.toml
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod daemon;
pub mod peer;
pub mod transaction;
pub mod volume;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use daemon::Daemon;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
