//! Cluster membership
//!
//! Peers are the daemons that make up the cluster. Each is known by a
//! stable UUID it chose itself; adding a peer asks the remote daemon for
//! that UUID and records it.

pub mod commands;
pub mod store;

pub use commands::{lock_name, PeerAddRequest, PeerCommands};
pub use store::{Peer, PeerStore};
