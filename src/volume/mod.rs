//! Volumes
//!
//! A volume is a named set of bricks spread over cluster nodes. Metadata is
//! kept in the cluster store; brick processes are node-local and driven by
//! the step functions in [`steps`].

pub mod bricks;
pub mod commands;
pub mod steps;
pub mod store;

pub use bricks::{BrickRunner, LocalBrickRunner};
pub use commands::{VolCreateRequest, VolumeCommands};
pub use store::{Brick, VolStatus, Volinfo, VolumeStore};
