//! Volume migration argument contracts.
//!
//! Both sides of a migration are driven by explicit argument structs; the
//! driver only understands whole-tree synchronization transfers.

use serde::{Deserialize, Serialize};

/// Transfer mode negotiated between the two hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationFsType {
    /// Whole-tree synchronization of the mounted filesystem.
    Rsync,
    /// Driver-specific optimized stream (unsupported by the dir backend).
    Optimized,
}

impl MigrationFsType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsync => "rsync",
            Self::Optimized => "optimized",
        }
    }
}

impl std::fmt::Display for MigrationFsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Negotiated transfer mode plus optional protocol feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationType {
    pub fs_type: MigrationFsType,
    pub features: Vec<String>,
}

impl MigrationType {
    /// Plain whole-tree transfer with no extra features.
    pub fn rsync() -> Self {
        Self { fs_type: MigrationFsType::Rsync, features: Vec::new() }
    }
}

/// Arguments driving the sending side of a migration.
#[derive(Debug, Clone)]
pub struct VolumeSourceArgs {
    /// Snapshot labels to send, in the order they must arrive.
    pub snapshots: Vec<String>,
    pub migration_type: MigrationType,
    /// Report per-unit byte progress on the operation context.
    pub track_progress: bool,
}

/// Arguments driving the receiving side of a migration.
#[derive(Debug, Clone)]
pub struct VolumeTargetArgs {
    /// Snapshot labels the sender will stream, in arrival order.
    pub snapshots: Vec<String>,
    pub migration_type: MigrationType,
    pub track_progress: bool,
    /// Live migration: one extra final sync pass of the main volume follows.
    pub live: bool,
}
