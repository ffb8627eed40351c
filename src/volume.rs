//! Volume domain types.
//!
//! A [`Volume`] identifies one unit of storage inside a pool. Values are
//! constructed transiently for the duration of a single operation; everything
//! derivable (mount path, snapshot directory, disk image path) is a pure
//! function of the identity and never stored.

use crate::error::{Result, StorageError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

/// Kind of volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    /// User-defined volume.
    Custom,
    /// Image volume backing instance roots.
    Image,
    /// Container root filesystem.
    Container,
    /// Virtual machine volume.
    Vm,
}

impl VolumeType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::Image => "image",
            Self::Container => "container",
            Self::Vm => "virtual-machine",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "custom" => Some(Self::Custom),
            "image" => Some(Self::Image),
            "container" => Some(Self::Container),
            "virtual-machine" | "vm" => Some(Self::Vm),
            _ => None,
        }
    }

    /// Directory name holding live volumes of this type inside a pool.
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::Image => "images",
            Self::Container => "containers",
            Self::Vm => "virtual-machines",
        }
    }

    /// Directory name holding snapshot containers of this type inside a pool.
    #[must_use]
    pub fn snapshots_dir_name(&self) -> &'static str {
        match self {
            Self::Custom => "custom-snapshots",
            Self::Image => "images-snapshots",
            Self::Container => "containers-snapshots",
            Self::Vm => "virtual-machines-snapshots",
        }
    }
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// On-disk representation of a volume's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Directory tree.
    Filesystem,
    /// Single raw disk-image file inside the volume directory.
    Block,
}

impl ContentType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Block => "block",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// File name of the raw disk image inside a block volume's directory.
pub const DISK_IMAGE_NAME: &str = "root.img";

/// A named, typed unit of storage belonging to a pool.
#[derive(Debug, Clone)]
pub struct Volume {
    pool: String,
    vol_type: VolumeType,
    content_type: ContentType,
    name: String,
    config: HashMap<String, String>,
}

impl Volume {
    /// Create a new volume identity.
    pub fn new(
        pool: impl Into<String>,
        vol_type: VolumeType,
        content_type: ContentType,
        name: impl Into<String>,
        config: HashMap<String, String>,
    ) -> Self {
        Self { pool: pool.into(), vol_type, content_type, name: name.into(), config }
    }

    /// Owning pool name.
    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Volume type.
    #[must_use]
    pub fn vol_type(&self) -> VolumeType {
        self.vol_type
    }

    /// Content representation.
    #[must_use]
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Volume name; `parent/label` for snapshots.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Volume-local config override for `key`.
    #[must_use]
    pub fn config(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    /// Whether this volume is a snapshot.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.name.contains('/')
    }

    /// Split the name into parent name and optional snapshot label.
    #[must_use]
    pub fn parent_and_label(&self) -> (&str, Option<&str>) {
        paths::split_volume_name(&self.name)
    }

    /// Mount path of the volume's live tree (or snapshot tree).
    #[must_use]
    pub fn mount_path(&self) -> PathBuf {
        paths::volume_mount_path(&self.pool, self.vol_type, &self.name)
    }

    /// Directory holding this volume's snapshots.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        let (parent, _) = self.parent_and_label();
        paths::volume_snapshot_dir(&self.pool, self.vol_type, parent)
    }

    /// Location of the raw disk image for block volumes.
    #[must_use]
    pub fn disk_image_path(&self) -> PathBuf {
        self.mount_path().join(DISK_IMAGE_NAME)
    }

    /// Derive the snapshot volume `self.name/label` of this volume.
    pub fn snapshot(&self, label: &str) -> Result<Volume> {
        if self.is_snapshot() {
            return Err(StorageError::ConfigInvalid {
                reason: format!("volume {} is itself a snapshot", self.name),
            });
        }

        Ok(Volume {
            pool: self.pool.clone(),
            vol_type: self.vol_type,
            content_type: self.content_type,
            name: paths::snapshot_volume_name(&self.name, label),
            config: self.config.clone(),
        })
    }

    /// Create the volume's mount path with 0711 permissions on the leaf.
    pub async fn create_mount_path(&self) -> Result<()> {
        let path = self.mount_path();
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::io("create mount path", &path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o711))
                .await
                .map_err(|e| StorageError::io("set mount path permissions", &path, e))?;
        }

        Ok(())
    }
}

/// Boxed async content filler invoked during volume creation.
///
/// Receives the mount path and, for block volumes, the path where the raw
/// disk image is expected to be materialized.
pub struct VolumeFiller {
    fill: FillFn,
}

type FillFn = Box<
    dyn Fn(PathBuf, Option<PathBuf>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

impl VolumeFiller {
    /// Wrap an async closure as a filler.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(PathBuf, Option<PathBuf>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self { fill: Box::new(move |path, block| Box::pin(f(path, block))) }
    }

    /// Run the filler against the given paths.
    pub async fn fill(&self, mount_path: &Path, block_path: Option<&Path>) -> Result<()> {
        (self.fill)(mount_path.to_path_buf(), block_path.map(Path::to_path_buf)).await
    }
}

impl std::fmt::Debug for VolumeFiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeFiller").finish_non_exhaustive()
    }
}
