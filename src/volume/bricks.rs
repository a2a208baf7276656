//! Brick lifecycle on the local node
//!
//! Starting and stopping brick processes is opaque to the transaction
//! engine; steps call into a [`BrickRunner`]. Every operation is idempotent
//! so undo steps can run whether or not the matching do took effect.

use crate::common::{Error, Result};
use crate::volume::store::Brick;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// File marking a directory as a brick of some volume
pub const BRICK_MARKER: &str = ".minigd-volume";

pub trait BrickRunner: Send + Sync {
    /// Claim the brick directory for its volume
    fn prepare(&self, brick: &Brick) -> Result<()>;
    /// Release a claimed brick directory
    fn cleanup(&self, brick: &Brick) -> Result<()>;
    fn start(&self, brick: &Brick) -> Result<()>;
    fn stop(&self, brick: &Brick) -> Result<()>;
    fn is_running(&self, brick: &Brick) -> bool;
}

#[derive(Debug, Clone)]
pub struct BrickProcess {
    pub volume: String,
    pub started_at: DateTime<Utc>,
}

/// Runner claiming brick directories on the local filesystem
///
/// Brick processes are tracked in memory.
#[derive(Default)]
pub struct LocalBrickRunner {
    running: Mutex<HashMap<String, BrickProcess>>,
}

impl LocalBrickRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths of running bricks
    pub fn running(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.running.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl BrickRunner for LocalBrickRunner {
    fn prepare(&self, brick: &Brick) -> Result<()> {
        let dir = Path::new(&brick.path);
        let marker = dir.join(BRICK_MARKER);
        if let Ok(owner) = std::fs::read_to_string(&marker) {
            if owner.trim() != brick.volume_name {
                return Err(Error::InvalidRequest(format!(
                    "brick {} is already part of volume {}",
                    brick,
                    owner.trim()
                )));
            }
            return Ok(());
        }
        std::fs::create_dir_all(dir)?;
        std::fs::write(&marker, &brick.volume_name)?;
        Ok(())
    }

    fn cleanup(&self, brick: &Brick) -> Result<()> {
        let marker = Path::new(&brick.path).join(BRICK_MARKER);
        match std::fs::read_to_string(&marker) {
            Ok(owner) if owner.trim() == brick.volume_name => {
                std::fs::remove_file(&marker)?;
                Ok(())
            }
            // Not ours or already gone
            _ => Ok(()),
        }
    }

    fn start(&self, brick: &Brick) -> Result<()> {
        if !Path::new(&brick.path).join(BRICK_MARKER).exists() {
            return Err(Error::Other(format!("brick {} is not prepared", brick)));
        }
        self.running
            .lock()
            .unwrap()
            .entry(brick.path.clone())
            .or_insert_with(|| BrickProcess {
                volume: brick.volume_name.clone(),
                started_at: Utc::now(),
            });
        Ok(())
    }

    fn stop(&self, brick: &Brick) -> Result<()> {
        self.running.lock().unwrap().remove(&brick.path);
        Ok(())
    }

    fn is_running(&self, brick: &Brick) -> bool {
        self.running.lock().unwrap().contains_key(&brick.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn brick(dir: &Path, volume: &str) -> Brick {
        Brick {
            node_id: Uuid::new_v4(),
            hostname: "n1".into(),
            path: dir.join("b1").to_string_lossy().into_owned(),
            volume_name: volume.to_string(),
        }
    }

    #[test]
    fn test_prepare_start_stop() {
        let dir = tempdir().unwrap();
        let runner = LocalBrickRunner::new();
        let b = brick(dir.path(), "vol1");

        assert!(runner.start(&b).is_err());
        runner.prepare(&b).unwrap();
        runner.prepare(&b).unwrap();
        runner.start(&b).unwrap();
        runner.start(&b).unwrap();
        assert!(runner.is_running(&b));
        assert_eq!(runner.running().len(), 1);

        runner.stop(&b).unwrap();
        runner.stop(&b).unwrap();
        assert!(!runner.is_running(&b));

        runner.cleanup(&b).unwrap();
        runner.cleanup(&b).unwrap();
        assert!(!Path::new(&b.path).join(BRICK_MARKER).exists());
    }

    #[test]
    fn test_brick_in_use_by_other_volume() {
        let dir = tempdir().unwrap();
        let runner = LocalBrickRunner::new();
        runner.prepare(&brick(dir.path(), "vol1")).unwrap();

        let other = brick(dir.path(), "vol2");
        assert!(runner.prepare(&other).is_err());
        // Cleanup by the wrong volume leaves the claim alone
        runner.cleanup(&other).unwrap();
        assert!(Path::new(&other.path).join(BRICK_MARKER).exists());
    }
}
