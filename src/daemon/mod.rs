//! The minigd daemon: command handlers plus the internal RPC server

pub mod http;
pub mod server;

pub use http::create_router;
pub use server::Daemon;
