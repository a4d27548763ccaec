//! Snapshot persistence
//!
//! Keeps the node's last snapshot in its data directory so a restart
//! recovers local state before bootstrap sync.

use std::path::{Path, PathBuf};

use crate::replication::Snapshot;
use crate::error::Result;

/// JSON snapshot file for one node
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    /// Snapshot file for `node_id` under `data_dir`
    pub fn new(data_dir: &Path, node_id: &str) -> Self {
        Self {
            path: data_dir.join(format!("{}.snapshot.json", node_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot; a missing file is not an error
    pub fn load(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        tracing::info!(
            "Loaded snapshot from {} ({} operations)",
            self.path.display(),
            snapshot.seen.len()
        );
        Ok(Some(snapshot))
    }

    /// Write the snapshot atomically
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
