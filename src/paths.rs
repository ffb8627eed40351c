//! Centralized path layout for dirpool.
//!
//! A volume's on-disk location is a pure function of its identity
//! (pool, type, name); all path derivation goes through this module so that
//! no two distinct identities can alias the same path.

use crate::volume::VolumeType;
use std::path::PathBuf;

/// Get the dirpool data directory.
///
/// Resolution order:
/// 1. `DIRPOOL_DATA_DIR` environment variable
/// 2. `/var/lib/dirpool` if it exists (system install)
/// 3. `~/.dirpool` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DIRPOOL_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/dirpool");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".dirpool")).unwrap_or(system_dir)
}

/// Get the directory holding all storage pools.
pub fn pools_dir() -> PathBuf {
    data_dir().join("pools")
}

/// Get the canonical mount path of a storage pool.
pub fn pool_mount_path(pool: &str) -> PathBuf {
    pools_dir().join(pool)
}

/// Get the mount path of a volume.
///
/// Snapshot volumes (named `parent/label`) live under the type's
/// `-snapshots` container so the live tree and its snapshots never nest.
pub fn volume_mount_path(pool: &str, vol_type: VolumeType, name: &str) -> PathBuf {
    let (parent, label) = split_volume_name(name);
    match label {
        Some(label) => pool_mount_path(pool)
            .join(vol_type.snapshots_dir_name())
            .join(parent)
            .join(label),
        None => pool_mount_path(pool).join(vol_type.dir_name()).join(parent),
    }
}

/// Get the directory holding all snapshots of a volume.
pub fn volume_snapshot_dir(pool: &str, vol_type: VolumeType, vol_name: &str) -> PathBuf {
    pool_mount_path(pool).join(vol_type.snapshots_dir_name()).join(vol_name)
}

/// Split a volume name into parent name and optional snapshot label.
pub fn split_volume_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once('/') {
        Some((parent, label)) => (parent, Some(label)),
        None => (name, None),
    }
}

/// Build the full volume name of a snapshot from its parent and label.
pub fn snapshot_volume_name(parent: &str, label: &str) -> String {
    format!("{}/{}", parent, label)
}
