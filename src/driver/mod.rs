//! Storage driver abstraction.
//!
//! A storage backend implements the [`StorageDriver`] capability set; the
//! plain-directory backend in [`dir`] is one variant, other backing-store
//! technologies implement the same contract. External collaborators (quota
//! mechanism, tree transport, metadata store, disk tooling, mounts) are
//! injected through [`DriverBackends`] so backends stay testable.

use crate::archive::BackupSource;
use crate::disk::DiskTool;
use crate::error::Result;
use crate::migration::{VolumeSourceArgs, VolumeTargetArgs};
use crate::mount::Mounter;
use crate::operation::Operation;
use crate::quota::QuotaBackend;
use crate::sync::{Connection, TreeSync};
use crate::volume::{Volume, VolumeFiller, VolumeType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

pub mod dir;

pub use dir::DirDriver;

/// Resolver of a volume's persistent numeric id from external metadata.
///
/// An id of zero means the volume is not under quota management and is a
/// fatal condition inside quota operations, never a silent skip.
#[async_trait]
pub trait VolumeIdResolver: Send + Sync {
    async fn volume_id(&self, vol_type: VolumeType, name: &str) -> Result<i64>;
}

/// Static description of a driver and its capabilities.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub volume_types: Vec<VolumeType>,
    pub optimized_images: bool,
    pub preserves_inodes: bool,
    pub remote: bool,
    pub block_backing: bool,
    pub running_quota_resize: bool,
    pub running_snapshot_freeze: bool,
}

/// External collaborators injected into a driver.
#[derive(Clone)]
pub struct DriverBackends {
    pub quota: Arc<dyn QuotaBackend>,
    pub sync: Arc<dyn TreeSync>,
    pub ids: Arc<dyn VolumeIdResolver>,
    pub disk: Arc<dyn DiskTool>,
    pub mounter: Arc<dyn Mounter>,
}

/// Deferred action run after volume metadata has been restored, completing a
/// backup restore (initial quota setup once sizing config is known).
pub type PostRestoreHook =
    Box<dyn FnOnce(Volume) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send>;

/// Deferred rollback removing every path a backup restore created; returned
/// to the caller so the wider restore transaction controls when it fires.
pub type RevertHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Full capability set of a storage backend.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Driver description and feature flags.
    fn info(&self) -> DriverInfo;

    // Pool lifecycle.

    /// Validate and prepare the pool definition on this storage device.
    async fn create(&self) -> Result<()>;

    /// Remove the storage pool from the storage device.
    async fn delete(&self, op: &Operation) -> Result<()>;

    /// Mount the storage pool onto its canonical path. Returns whether a
    /// mount was performed.
    async fn mount(&self) -> Result<bool>;

    /// Unmount the storage pool. Returns whether anything was unmounted.
    async fn unmount(&self) -> Result<bool>;

    /// Apply pool config changes.
    async fn update(&self, changed: &HashMap<String, String>) -> Result<()>;

    // Volume lifecycle.

    /// Whether the volume exists on this pool.
    fn has_volume(&self, vol: &Volume) -> bool;

    /// Location of a block volume's raw disk image.
    fn volume_disk_path(&self, vol: &Volume) -> PathBuf;

    /// Disk space used by the volume, or `None` when usage cannot be tracked.
    async fn volume_usage(&self, vol: &Volume) -> Result<Option<u64>>;

    /// Create an empty volume, optionally filling it with content.
    async fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&VolumeFiller>,
        op: &Operation,
    ) -> Result<()>;

    /// Delete a volume. Fails if snapshots remain; idempotent when absent.
    async fn delete_volume(&self, vol: &Volume, op: &Operation) -> Result<()>;

    /// Apply volume config changes.
    async fn update_volume(&self, vol: &Volume, changed: &HashMap<String, String>) -> Result<()>;

    /// Rename a volume and its snapshot container.
    async fn rename_volume(&self, vol: &Volume, new_name: &str, op: &Operation) -> Result<()>;

    /// Overwrite the volume's live tree with the named snapshot's tree.
    async fn restore_volume(&self, vol: &Volume, snapshot_label: &str, op: &Operation)
        -> Result<()>;

    /// Re-apply the volume's size limit.
    async fn set_volume_quota(&self, vol: &Volume, size: &str, op: &Operation) -> Result<()>;

    /// Create a volume as a copy of another, optionally with its snapshots.
    async fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        copy_snapshots: bool,
        op: &Operation,
    ) -> Result<()>;

    /// Re-sync an existing volume (and the given snapshots) from a source volume.
    async fn refresh_volume(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        src_snapshots: &[Volume],
        op: &Operation,
    ) -> Result<()>;

    // Migration.

    /// Stream a volume (and the requested snapshots, in order) to a peer.
    async fn migrate_volume(
        &self,
        vol: &Volume,
        conn: &mut dyn Connection,
        args: &VolumeSourceArgs,
        op: &Operation,
    ) -> Result<()>;

    /// Materialize a volume from a peer's migration stream.
    async fn create_volume_from_migration(
        &self,
        vol: &Volume,
        conn: &mut dyn Connection,
        args: &VolumeTargetArgs,
        pre_filler: Option<&VolumeFiller>,
        op: &Operation,
    ) -> Result<()>;

    // Snapshots.

    /// List the snapshot labels of a volume.
    async fn volume_snapshots(&self, vol: &Volume) -> Result<Vec<String>>;

    /// Create a point-in-time copy of the parent volume's live tree.
    async fn create_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> Result<()>;

    /// Remove a snapshot, and its parent container when it was the last one.
    async fn delete_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> Result<()>;

    /// Rename a snapshot.
    async fn rename_volume_snapshot(
        &self,
        snap_vol: &Volume,
        new_label: &str,
        op: &Operation,
    ) -> Result<()>;

    /// Mount protection over a snapshot to avoid accidental modification.
    async fn mount_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> Result<bool>;

    /// Remove the protective mount placed on a snapshot.
    async fn unmount_volume_snapshot(&self, snap_vol: &Volume, op: &Operation) -> Result<bool>;

    // Backup.

    /// Copy a volume (and optionally its snapshots) to a staging path.
    async fn backup_volume(
        &self,
        vol: &Volume,
        target_path: &Path,
        snapshots: bool,
        op: &Operation,
    ) -> Result<()>;

    /// Restore a backup tarball onto the storage device.
    ///
    /// Returns the deferred post-restore and revert hooks described on
    /// [`PostRestoreHook`] and [`RevertHook`].
    async fn restore_backup_volume(
        &self,
        vol: &Volume,
        snapshots: &[String],
        src: &mut dyn BackupSource,
        op: &Operation,
    ) -> Result<(PostRestoreHook, RevertHook)>;
}
