//! Plain-directory storage backend.
//!
//! Volumes are directory trees (or raw image files) under the pool's mount
//! path. There is no atomic commit primitive to lean on: every multi-step
//! operation registers undo actions on a [`Reverter`] the instant a side
//! effect lands, and settles the list at its single exit point.

use super::{
    DriverBackends, DriverInfo, PostRestoreHook, RevertHook, StorageDriver, VolumeIdResolver,
};
use crate::archive::{self, BackupSource};
use crate::disk::DiskTool;
use crate::error::{Result, StorageError};
use crate::migration::{MigrationFsType, VolumeSourceArgs, VolumeTargetArgs};
use crate::mount::Mounter;
use crate::operation::Operation;
use crate::paths;
use crate::quota::QuotaManager;
use crate::revert::Reverter;
use crate::sync::{Connection, TreeSync};
use crate::units;
use crate::volume::{ContentType, Volume, VolumeFiller, VolumeType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Disk image size used when neither volume nor pool config specify one.
const DEFAULT_BLOCK_SIZE: &str = "10GiB";

/// Directory entry name holding the instance tree inside a backup.
const BACKUP_CONTAINER_ENTRY: &str = "container";

/// Directory-backed storage driver.
#[derive(Clone)]
pub struct DirDriver {
    pool: String,
    config: HashMap<String, String>,
    quota: QuotaManager,
    sync: Arc<dyn TreeSync>,
    ids: Arc<dyn VolumeIdResolver>,
    disk: Arc<dyn DiskTool>,
    mounter: Arc<dyn Mounter>,
}

impl DirDriver {
    /// Create a driver for `pool` with the given pool config and backends.
    pub fn new(
        pool: impl Into<String>,
        config: HashMap<String, String>,
        backends: DriverBackends,
    ) -> Self {
        let default_size = config.get("volume.size").filter(|s| !s.is_empty()).cloned();
        Self {
            pool: pool.into(),
            config,
            quota: QuotaManager::new(backends.quota, default_size),
            sync: backends.sync,
            ids: backends.ids,
            disk: backends.disk,
            mounter: backends.mounter,
        }
    }

    /// Pool name.
    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Effective pool source, defaulting to the canonical mount path.
    fn source(&self) -> PathBuf {
        match self.config.get("source").filter(|s| !s.is_empty()) {
            Some(source) => PathBuf::from(source),
            None => paths::pool_mount_path(&self.pool),
        }
    }

    fn bwlimit(&self) -> Option<&str> {
        self.config.get("rsync.bwlimit").map(String::as_str).filter(|s| !s.is_empty())
    }

    async fn vol_id(&self, vol: &Volume) -> Result<i64> {
        self.ids.volume_id(vol.vol_type(), vol.name()).await
    }

    /// Enable quota on a freshly created volume directory and apply the
    /// configured size, registering the removal as an undo action.
    async fn setup_initial_quota(
        &self,
        vol: &Volume,
        vol_id: i64,
        revert: &mut Reverter,
    ) -> Result<()> {
        let vol_path = vol.mount_path();
        self.quota.init(&vol_path, vol_id).await?;

        let quota = self.quota.clone();
        let undo_path = vol_path.clone();
        revert.add(move || async move {
            if let Err(e) = quota.delete(&undo_path, vol_id).await {
                warn!(path = %undo_path.display(), error = %e, "failed to roll back quota");
            }
        });

        self.quota.set(&vol_path, vol_id, vol.config("size").unwrap_or("")).await
    }

    fn snapshot_label_of(snap_vol: &Volume) -> Result<(&str, &str)> {
        match snap_vol.parent_and_label() {
            (parent, Some(label)) => Ok((parent, label)),
            (_, None) => Err(StorageError::ConfigInvalid {
                reason: format!("snapshot name required, got {:?}", snap_vol.name()),
            }),
        }
    }

    async fn delete_parent_snapshot_dir_if_empty(
        &self,
        vol_type: VolumeType,
        parent: &str,
    ) -> Result<()> {
        let snapshot_dir = paths::volume_snapshot_dir(&self.pool, vol_type, parent);
        let mut entries = match tokio::fs::read_dir(&snapshot_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io("read snapshot container", &snapshot_dir, e)),
        };

        let has_entries = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io("read snapshot container", &snapshot_dir, e))?
            .is_some();
        if has_entries {
            return Ok(());
        }

        tokio::fs::remove_dir(&snapshot_dir)
            .await
            .map_err(|e| StorageError::io("remove snapshot container", &snapshot_dir, e))
    }

    async fn ensure_snapshot_container(&self, vol_type: VolumeType, parent: &str) -> Result<()> {
        let snapshot_dir = paths::volume_snapshot_dir(&self.pool, vol_type, parent);
        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .map_err(|e| StorageError::io("create snapshot container", &snapshot_dir, e))?;
        set_dir_mode(&snapshot_dir, 0o711).await
    }

    /// Shared by copy and refresh: copy a volume and specific snapshots,
    /// unwinding everything created so far on failure.
    async fn copy_volume(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        src_snapshots: &[Volume],
        op: &Operation,
    ) -> Result<()> {
        if vol.content_type() != ContentType::Filesystem
            || src_vol.content_type() != ContentType::Filesystem
        {
            return Err(StorageError::ContentTypeUnsupported {
                operation: "copy volume",
                content_type: ContentType::Block,
            });
        }

        // Resolving the id first keeps unresolved volumes free of mutations.
        let vol_id = self.vol_id(vol).await?;
        let vol_path = vol.mount_path();

        let mut revert = Reverter::new();
        let result: Result<()> = async {
            op.check_cancelled()?;
            vol.create_mount_path().await?;

            let undo_path = vol_path.clone();
            revert.add(move || async move {
                let _ = tokio::fs::remove_dir_all(&undo_path).await;
            });

            if !src_vol.is_snapshot() {
                for src_snapshot in src_snapshots {
                    op.check_cancelled()?;
                    let (_, label) = Self::snapshot_label_of(src_snapshot)?;
                    let snap_path = src_snapshot.mount_path();

                    // The source snapshot's state is copied into the live
                    // destination tree, then captured as a new snapshot.
                    self.mounter.mount_read_only(&snap_path)?;
                    let copied =
                        self.sync.local_copy(&snap_path, &vol_path, self.bwlimit(), true).await;
                    if let Err(e) = self.mounter.unmount_all(&snap_path) {
                        warn!(path = %snap_path.display(), error = %e, "failed to drop snapshot protection mount");
                    }
                    copied?;

                    let dst_snapshot = vol.snapshot(label)?;
                    self.create_volume_snapshot(&dst_snapshot, op).await?;

                    let driver = self.clone();
                    let undo_snapshot = dst_snapshot.clone();
                    let undo_op = op.clone();
                    revert.add(move || async move {
                        if let Err(e) =
                            driver.delete_volume_snapshot(&undo_snapshot, &undo_op).await
                        {
                            warn!(snapshot = %undo_snapshot.name(), error = %e, "failed to roll back snapshot");
                        }
                    });
                }
            }

            self.quota.init(&vol_path, vol_id).await?;
            self.quota.set(&vol_path, vol_id, vol.config("size").unwrap_or("")).await?;

            op.check_cancelled()?;
            self.sync.local_copy(&src_vol.mount_path(), &vol_path, self.bwlimit(), true).await?;
            Ok(())
        }
        .await;

        revert.settle(result).await
    }
}

#[async_trait]
impl StorageDriver for DirDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo {
            name: "dir",
            version: "1",
            volume_types: vec![
                VolumeType::Custom,
                VolumeType::Image,
                VolumeType::Container,
                VolumeType::Vm,
            ],
            optimized_images: false,
            preserves_inodes: false,
            remote: false,
            block_backing: false,
            running_quota_resize: true,
            running_snapshot_freeze: true,
        }
    }

    async fn create(&self) -> Result<()> {
        let mount_path = paths::pool_mount_path(&self.pool);
        let source = self.source();

        if !source.exists() {
            return Err(StorageError::ConfigInvalid {
                reason: format!("source path {:?} doesn't exist", source),
            });
        }

        // A source inside the managed tree must be exactly the pool's own
        // canonical mount path, anything else would nest pools.
        if source.starts_with(paths::data_dir()) && source != mount_path {
            return Err(StorageError::ConfigInvalid {
                reason: format!("source path {:?} is within the dirpool directory", source),
            });
        }

        let mut entries = std::fs::read_dir(&source)
            .map_err(|e| StorageError::io("read source", &source, e))?;
        if entries.next().is_some() {
            return Err(StorageError::ConfigInvalid {
                reason: format!("source path {:?} isn't empty", source),
            });
        }

        Ok(())
    }

    #[instrument(skip(self, _op), fields(pool = %self.pool))]
    async fn delete(&self, _op: &Operation) -> Result<()> {
        wipe_directory(&paths::pool_mount_path(&self.pool)).await?;
        self.unmount().await?;
        info!("storage pool deleted");
        Ok(())
    }

    async fn mount(&self) -> Result<bool> {
        let mount_path = paths::pool_mount_path(&self.pool);
        let source = self.source();

        // A pool rooted at its canonical path is an external mount already.
        if source == mount_path {
            return Ok(false);
        }

        if self.mounter.is_mounted(&mount_path) {
            return Ok(false);
        }

        self.mounter.bind_mount(&source, &mount_path)?;
        Ok(true)
    }

    async fn unmount(&self) -> Result<bool> {
        let mount_path = paths::pool_mount_path(&self.pool);
        if self.source() == mount_path {
            return Ok(false);
        }

        self.mounter.unmount_all(&mount_path)
    }

    async fn update(&self, _changed: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    fn has_volume(&self, vol: &Volume) -> bool {
        vol.mount_path().exists()
    }

    fn volume_disk_path(&self, vol: &Volume) -> PathBuf {
        vol.disk_image_path()
    }

    async fn volume_usage(&self, vol: &Volume) -> Result<Option<u64>> {
        let vol_path = vol.mount_path();
        if !self.quota.supported(&vol_path).await {
            return Ok(None);
        }

        let vol_id = self.vol_id(vol).await?;
        self.quota.usage(&vol_path, vol_id).await
    }

    #[instrument(skip(self, filler, op), fields(pool = %self.pool, volume = %vol.name()))]
    async fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&VolumeFiller>,
        op: &Operation,
    ) -> Result<()> {
        op.check_cancelled()?;

        // Block volumes take no quota (the image size is the limit), so the
        // id is only needed, and resolved, for filesystem content. Resolution
        // happens before the first mutation.
        let vol_id = match vol.content_type() {
            ContentType::Filesystem => Some(self.vol_id(vol).await?),
            ContentType::Block => None,
        };

        let vol_path = vol.mount_path();
        let mut revert = Reverter::new();
        let result: Result<()> = async {
            vol.create_mount_path().await?;

            let undo_path = vol_path.clone();
            revert.add(move || async move {
                let _ = tokio::fs::remove_dir_all(&undo_path).await;
            });

            let block_path = match vol.content_type() {
                // The filler is expected to materialize the image here.
                ContentType::Block => Some(vol.disk_image_path()),
                ContentType::Filesystem => None,
            };

            if let Some(vol_id) = vol_id {
                self.setup_initial_quota(vol, vol_id, &mut revert).await?;
            }

            if let Some(filler) = filler {
                debug!("running volume filler");
                filler.fill(&vol_path, block_path.as_deref()).await?;
            }

            // Size (or grow) the raw image to the requested size, creating an
            // empty one when no filler provided it.
            if let Some(block_path) = block_path {
                let size = vol
                    .config("size")
                    .filter(|s| !s.is_empty() && *s != "0")
                    .or_else(|| self.config.get("volume.size").map(String::as_str))
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_BLOCK_SIZE);
                let bytes = units::parse_byte_size(size)?;

                if block_path.exists() {
                    self.disk.resize_raw(&block_path, bytes).await?;
                } else {
                    self.disk.create_raw(&block_path, bytes).await?;
                }
            }

            Ok(())
        }
        .await;

        let result = revert.settle(result).await;
        if result.is_ok() {
            info!("volume created");
        }
        result
    }

    #[instrument(skip(self, op), fields(pool = %self.pool, volume = %vol.name()))]
    async fn delete_volume(&self, vol: &Volume, op: &Operation) -> Result<()> {
        let snapshots = self.volume_snapshots(vol).await?;
        if !snapshots.is_empty() {
            return Err(StorageError::HasSnapshots { volume: vol.name().to_string() });
        }

        let vol_path = vol.mount_path();
        if !vol_path.exists() {
            debug!("volume already absent");
            return Ok(());
        }

        let vol_id = self.vol_id(vol).await?;
        self.quota.delete(&vol_path, vol_id).await?;

        tokio::fs::remove_dir_all(&vol_path)
            .await
            .map_err(|e| StorageError::io("remove volume", &vol_path, e))?;

        // The snapshot container should already be gone; clear a leftover
        // empty top-level directory.
        let (parent, _) = vol.parent_and_label();
        self.delete_parent_snapshot_dir_if_empty(vol.vol_type(), parent).await?;

        info!("volume deleted");
        Ok(())
    }

    async fn update_volume(&self, vol: &Volume, changed: &HashMap<String, String>) -> Result<()> {
        if vol.content_type() != ContentType::Filesystem {
            return Err(StorageError::ContentTypeUnsupported {
                operation: "update volume",
                content_type: vol.content_type(),
            });
        }

        // Only a size change has any effect at this layer.
        if let Some(size) = changed.get("size") {
            let vol_id = self.vol_id(vol).await?;
            self.quota.set(&vol.mount_path(), vol_id, size).await?;
        }

        Ok(())
    }

    #[instrument(skip(self, _op), fields(pool = %self.pool, volume = %vol.name(), new_name))]
    async fn rename_volume(&self, vol: &Volume, new_name: &str, _op: &Operation) -> Result<()> {
        let src_path = vol.mount_path();
        let dst_path = paths::volume_mount_path(&self.pool, vol.vol_type(), new_name);

        if dst_path.exists() {
            return Err(StorageError::ConfigInvalid {
                reason: format!("volume {:?} already exists", new_name),
            });
        }

        let mut revert = Reverter::new();
        let result: Result<()> = async {
            tokio::fs::rename(&src_path, &dst_path)
                .await
                .map_err(|e| StorageError::io("rename volume", &src_path, e))?;

            let undo_src = src_path.clone();
            let undo_dst = dst_path.clone();
            revert.add(move || async move {
                let _ = tokio::fs::rename(&undo_dst, &undo_src).await;
            });

            let (parent, _) = vol.parent_and_label();
            let src_snapshots = paths::volume_snapshot_dir(&self.pool, vol.vol_type(), parent);
            if src_snapshots.exists() {
                let dst_snapshots =
                    paths::volume_snapshot_dir(&self.pool, vol.vol_type(), new_name);
                tokio::fs::rename(&src_snapshots, &dst_snapshots)
                    .await
                    .map_err(|e| StorageError::io("rename snapshot container", &src_snapshots, e))?;
            }

            Ok(())
        }
        .await;

        revert.settle(result).await
    }

    #[instrument(skip(self, _op), fields(pool = %self.pool, volume = %vol.name(), snapshot = snapshot_label))]
    async fn restore_volume(
        &self,
        vol: &Volume,
        snapshot_label: &str,
        _op: &Operation,
    ) -> Result<()> {
        let snap_vol = vol.snapshot(snapshot_label)?;
        let snap_path = snap_vol.mount_path();
        if !snap_path.exists() {
            return Err(StorageError::SnapshotNotFound { name: snap_vol.name().to_string() });
        }

        self.sync.local_copy(&snap_path, &vol.mount_path(), self.bwlimit(), true).await?;
        info!("volume restored from snapshot");
        Ok(())
    }

    async fn set_volume_quota(&self, vol: &Volume, size: &str, _op: &Operation) -> Result<()> {
        let vol_id = self.vol_id(vol).await?;
        self.quota.set(&vol.mount_path(), vol_id, size).await
    }

    #[instrument(skip(self, op), fields(pool = %self.pool, volume = %vol.name(), source = %src_vol.name()))]
    async fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        copy_snapshots: bool,
        op: &Operation,
    ) -> Result<()> {
        let src_snapshots = if copy_snapshots && !src_vol.is_snapshot() {
            let labels = self.volume_snapshots(src_vol).await?;
            labels
                .iter()
                .map(|label| src_vol.snapshot(label))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        self.copy_volume(vol, src_vol, &src_snapshots, op).await
    }

    async fn refresh_volume(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        src_snapshots: &[Volume],
        op: &Operation,
    ) -> Result<()> {
        self.copy_volume(vol, src_vol, src_snapshots, op).await
    }

    #[instrument(skip(self, conn, args, op), fields(pool = %self.pool, volume = %vol.name()))]
    async fn migrate_volume(
        &self,
        vol: &Volume,
        conn: &mut dyn Connection,
        args: &VolumeSourceArgs,
        op: &Operation,
    ) -> Result<()> {
        if vol.content_type() != ContentType::Filesystem {
            return Err(StorageError::ContentTypeUnsupported {
                operation: "migrate volume",
                content_type: vol.content_type(),
            });
        }

        if args.migration_type.fs_type != MigrationFsType::Rsync {
            return Err(StorageError::UnsupportedMigrationKind {
                reason: format!("transfer mode {}", args.migration_type.fs_type),
            });
        }

        let features = &args.migration_type.features;

        // Snapshots go first, in the caller's order; the receiver registers
        // each before the next begins.
        for label in &args.snapshots {
            op.check_cancelled()?;

            let snap_vol = vol.snapshot(label)?;
            let snap_path = snap_vol.mount_path();
            if !snap_path.exists() {
                return Err(StorageError::SnapshotNotFound { name: snap_vol.name().to_string() });
            }

            debug!(snapshot = %label, "sending snapshot");
            self.mounter.mount_read_only(&snap_path)?;
            let sink = args.track_progress.then(|| op.progress_sink(label));
            let sent = self
                .sync
                .send(label, &snap_path, conn, sink.as_ref(), features, self.bwlimit())
                .await;
            if let Err(e) = self.mounter.unmount_all(&snap_path) {
                warn!(path = %snap_path.display(), error = %e, "failed to drop snapshot protection mount");
            }
            sent?;
        }

        op.check_cancelled()?;
        debug!("sending main volume");
        let sink = args.track_progress.then(|| op.progress_sink(vol.name()));
        self.sync
            .send(vol.name(), &vol.mount_path(), conn, sink.as_ref(), features, self.bwlimit())
            .await
    }

    #[instrument(skip(self, conn, args, pre_filler, op), fields(pool = %self.pool, volume = %vol.name()))]
    async fn create_volume_from_migration(
        &self,
        vol: &Volume,
        conn: &mut dyn Connection,
        args: &VolumeTargetArgs,
        pre_filler: Option<&VolumeFiller>,
        op: &Operation,
    ) -> Result<()> {
        if vol.content_type() != ContentType::Filesystem {
            return Err(StorageError::ContentTypeUnsupported {
                operation: "create volume from migration",
                content_type: vol.content_type(),
            });
        }

        if args.migration_type.fs_type != MigrationFsType::Rsync {
            return Err(StorageError::UnsupportedMigrationKind {
                reason: format!("transfer mode {}", args.migration_type.fs_type),
            });
        }

        let vol_id = self.vol_id(vol).await?;
        let vol_path = vol.mount_path();
        let features = &args.migration_type.features;

        let mut revert = Reverter::new();
        let result: Result<()> = async {
            op.check_cancelled()?;
            vol.create_mount_path().await?;

            let undo_path = vol_path.clone();
            revert.add(move || async move {
                let _ = tokio::fs::remove_dir_all(&undo_path).await;
            });

            // Seed metadata before any content arrives.
            if let Some(filler) = pre_filler {
                debug!("running pre-filler");
                filler.fill(&vol_path, None).await?;
            }

            // Snapshots arrive first: receive each into the live path and
            // register it before the next transfer begins.
            for label in &args.snapshots {
                op.check_cancelled()?;

                debug!(snapshot = %label, "receiving snapshot");
                let sink = args.track_progress.then(|| op.progress_sink(label));
                self.sync.recv(&vol_path, conn, sink.as_ref(), features).await?;

                let snap_vol = vol.snapshot(label)?;
                self.create_volume_snapshot(&snap_vol, op).await?;

                let driver = self.clone();
                let undo_snapshot = snap_vol.clone();
                let undo_op = op.clone();
                revert.add(move || async move {
                    if let Err(e) = driver.delete_volume_snapshot(&undo_snapshot, &undo_op).await {
                        warn!(snapshot = %undo_snapshot.name(), error = %e, "failed to roll back snapshot");
                    }
                });
            }

            self.quota.init(&vol_path, vol_id).await?;
            self.quota.set(&vol_path, vol_id, vol.config("size").unwrap_or("")).await?;

            op.check_cancelled()?;
            debug!("receiving main volume");
            let sink = args.track_progress.then(|| op.progress_sink(vol.name()));
            self.sync.recv(&vol_path, conn, sink.as_ref(), features).await?;

            // Live migration: one more pass captures writes made on the
            // source after the bulk transfer window closed.
            if args.live {
                op.check_cancelled()?;
                debug!("receiving main volume (final stage)");
                let sink = args.track_progress.then(|| op.progress_sink(vol.name()));
                self.sync.recv(&vol_path, conn, sink.as_ref(), features).await?;
            }

            Ok(())
        }
        .await;

        let result = revert.settle(result).await;
        if result.is_ok() {
            info!("volume received from migration");
        }
        result
    }

    async fn volume_snapshots(&self, vol: &Volume) -> Result<Vec<String>> {
        let (parent, _) = vol.parent_and_label();
        let snapshot_dir = paths::volume_snapshot_dir(&self.pool, vol.vol_type(), parent);

        let mut entries = match tokio::fs::read_dir(&snapshot_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io("list snapshots", &snapshot_dir, e)),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io("list snapshots", &snapshot_dir, e))?
        {
            snapshots.push(entry.file_name().to_string_lossy().into_owned());
        }

        snapshots.sort();
        Ok(snapshots)
    }

    #[instrument(skip(self, _op), fields(pool = %self.pool, snapshot = %snap_vol.name()))]
    async fn create_volume_snapshot(&self, snap_vol: &Volume, _op: &Operation) -> Result<()> {
        let (parent, _label) = Self::snapshot_label_of(snap_vol)?;
        let src_path = paths::volume_mount_path(&self.pool, snap_vol.vol_type(), parent);
        let snap_path = snap_vol.mount_path();

        self.ensure_snapshot_container(snap_vol.vol_type(), parent).await?;

        let mut revert = Reverter::new();
        let result: Result<()> = async {
            snap_vol.create_mount_path().await?;

            let undo_path = snap_path.clone();
            revert.add(move || async move {
                let _ = tokio::fs::remove_dir_all(&undo_path).await;
            });

            self.sync.local_copy(&src_path, &snap_path, self.bwlimit(), true).await?;
            Ok(())
        }
        .await;

        let result = revert.settle(result).await;
        if result.is_ok() {
            info!("snapshot created");
        }
        result
    }

    #[instrument(skip(self, _op), fields(pool = %self.pool, snapshot = %snap_vol.name()))]
    async fn delete_volume_snapshot(&self, snap_vol: &Volume, _op: &Operation) -> Result<()> {
        let (parent, _label) = Self::snapshot_label_of(snap_vol)?;

        let snap_path = snap_vol.mount_path();
        if snap_path.exists() {
            tokio::fs::remove_dir_all(&snap_path)
                .await
                .map_err(|e| StorageError::io("remove snapshot", &snap_path, e))?;
        }

        // Dropping the last snapshot also drops the container directory.
        self.delete_parent_snapshot_dir_if_empty(snap_vol.vol_type(), parent).await?;

        info!("snapshot deleted");
        Ok(())
    }

    async fn rename_volume_snapshot(
        &self,
        snap_vol: &Volume,
        new_label: &str,
        _op: &Operation,
    ) -> Result<()> {
        let (parent, _label) = Self::snapshot_label_of(snap_vol)?;

        let src_path = snap_vol.mount_path();
        if !src_path.exists() {
            return Err(StorageError::SnapshotNotFound { name: snap_vol.name().to_string() });
        }

        let dst_name = paths::snapshot_volume_name(parent, new_label);
        let dst_path = paths::volume_mount_path(&self.pool, snap_vol.vol_type(), &dst_name);
        if dst_path.exists() {
            return Err(StorageError::ConfigInvalid {
                reason: format!("snapshot {:?} already exists", dst_name),
            });
        }

        tokio::fs::rename(&src_path, &dst_path)
            .await
            .map_err(|e| StorageError::io("rename snapshot", &src_path, e))
    }

    async fn mount_volume_snapshot(&self, snap_vol: &Volume, _op: &Operation) -> Result<bool> {
        self.mounter.mount_read_only(&snap_vol.mount_path())?;
        Ok(true)
    }

    async fn unmount_volume_snapshot(&self, snap_vol: &Volume, _op: &Operation) -> Result<bool> {
        self.mounter.unmount_all(&snap_vol.mount_path())
    }

    #[instrument(skip(self, op), fields(pool = %self.pool, volume = %vol.name()))]
    async fn backup_volume(
        &self,
        vol: &Volume,
        target_path: &Path,
        snapshots: bool,
        op: &Operation,
    ) -> Result<()> {
        // Backups are only implemented for containers currently.
        if vol.vol_type() != VolumeType::Container {
            return Err(StorageError::NotImplemented {
                feature: format!("backup of {} volumes", vol.vol_type()),
            });
        }

        if snapshots {
            let labels = self.volume_snapshots(vol).await?;
            if !labels.is_empty() {
                let snapshots_path = target_path.join("snapshots");
                tokio::fs::create_dir_all(&snapshots_path)
                    .await
                    .map_err(|e| StorageError::io("create backup snapshots dir", &snapshots_path, e))?;
                set_dir_mode(&snapshots_path, 0o711).await?;

                for label in labels {
                    op.check_cancelled()?;
                    let snap_vol = vol.snapshot(&label)?;
                    let target = snapshots_path.join(&label);
                    self.sync
                        .local_copy(&snap_vol.mount_path(), &target, self.bwlimit(), true)
                        .await?;
                }
            }
        }

        op.check_cancelled()?;
        let target = target_path.join(BACKUP_CONTAINER_ENTRY);
        self.sync.local_copy(&vol.mount_path(), &target, self.bwlimit(), true).await?;
        info!("volume backed up");
        Ok(())
    }

    #[instrument(skip(self, src, _op), fields(pool = %self.pool, volume = %vol.name()))]
    async fn restore_backup_volume(
        &self,
        vol: &Volume,
        snapshots: &[String],
        src: &mut dyn BackupSource,
        _op: &Operation,
    ) -> Result<(PostRestoreHook, RevertHook)> {
        let mut revert_paths: Vec<PathBuf> = Vec::new();

        let result: Result<()> = async {
            let vol_path = vol.mount_path();
            vol.create_mount_path().await?;
            revert_paths.push(vol_path.clone());

            let compression = archive::detect_compression(src)?;

            // Extract the instance tree.
            archive::unpack_prefix(src, compression, "backup/container", 2, &vol_path)?;

            if !snapshots.is_empty() {
                let (parent, _) = vol.parent_and_label();
                let snapshot_dir =
                    paths::volume_snapshot_dir(&self.pool, vol.vol_type(), parent);
                tokio::fs::create_dir_all(&snapshot_dir)
                    .await
                    .map_err(|e| StorageError::io("create snapshot container", &snapshot_dir, e))?;
                set_dir_mode(&snapshot_dir, 0o711).await?;
                revert_paths.push(snapshot_dir.clone());

                archive::unpack_prefix(src, compression, "backup/snapshots", 2, &snapshot_dir)?;
            }

            Ok(())
        }
        .await;

        if let Err(e) = result {
            for path in &revert_paths {
                let _ = tokio::fs::remove_dir_all(path).await;
            }
            return Err(e);
        }

        // Quota setup must wait until the volume's metadata (and with it the
        // sizing config) has been restored by the caller.
        let driver = self.clone();
        let post_hook: PostRestoreHook = Box::new(move |vol: Volume| {
            Box::pin(async move {
                let vol_id = driver.vol_id(&vol).await?;
                let vol_path = vol.mount_path();
                let mut revert = Reverter::new();
                let result = driver.setup_initial_quota(&vol, vol_id, &mut revert).await;
                revert.settle(result).await
            })
        });

        // Rollback stays with the caller: this restore is one step of a wider
        // transaction that may still fail after we return.
        let revert_hook: RevertHook = Box::new(move || {
            Box::pin(async move {
                for path in revert_paths {
                    let _ = tokio::fs::remove_dir_all(&path).await;
                }
            })
        });

        Ok((post_hook, revert_hook))
    }
}

async fn set_dir_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| StorageError::io("set directory permissions", path, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

/// Remove everything inside `path` without removing `path` itself.
async fn wipe_directory(path: &Path) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StorageError::io("read directory", path, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StorageError::io("read directory", path, e))?
    {
        let entry_path = entry.path();
        let meta = tokio::fs::symlink_metadata(&entry_path)
            .await
            .map_err(|e| StorageError::io("stat entry", &entry_path, e))?;

        if meta.is_dir() {
            tokio::fs::remove_dir_all(&entry_path)
                .await
                .map_err(|e| StorageError::io("remove directory", &entry_path, e))?;
        } else {
            tokio::fs::remove_file(&entry_path)
                .await
                .map_err(|e| StorageError::io("remove file", &entry_path, e))?;
        }
    }

    Ok(())
}
