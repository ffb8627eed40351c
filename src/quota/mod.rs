//! Project quota subsystem.
//!
//! Limits are attached to a numeric project id derived from the volume's
//! persistent id rather than to the path alone, so one filesystem tree can
//! host independently limited volumes without hierarchical quota nesting.
//! The kernel mechanism itself is behind [`QuotaBackend`]; a filesystem
//! without project quota support degrades to unenforced limits, which is
//! logged and treated as success.

use crate::error::{Result, StorageError};
use crate::units;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Offset added to a volume id to form its quota project id.
pub const PROJECT_ID_OFFSET: i64 = 10_000;

/// Derive the quota project id for a volume id, truncated to the project-id width.
#[must_use]
pub fn project_id(vol_id: i64) -> u32 {
    (vol_id + PROJECT_ID_OFFSET) as u32
}

/// Kernel project-quota mechanism, consumed by the driver.
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    /// Whether the filesystem backing `path` supports project quotas.
    async fn supported(&self, path: &Path) -> bool;

    /// Assign `path` (recursively) to the quota project `id`. Id 0 clears.
    async fn set_project(&self, path: &Path, id: u32) -> Result<()>;

    /// Set the byte limit for project `id` on the filesystem of `path`. 0 removes the limit.
    async fn set_project_quota(&self, path: &Path, id: u32, bytes: u64) -> Result<()>;

    /// Bytes currently used by project `id` on the filesystem of `path`.
    async fn get_project_usage(&self, path: &Path, id: u32) -> Result<u64>;
}

/// Backend for filesystems without project quota support; every operation is a no-op.
pub struct UnsupportedQuota;

#[async_trait]
impl QuotaBackend for UnsupportedQuota {
    async fn supported(&self, _path: &Path) -> bool {
        false
    }

    async fn set_project(&self, _path: &Path, _id: u32) -> Result<()> {
        Ok(())
    }

    async fn set_project_quota(&self, _path: &Path, _id: u32, _bytes: u64) -> Result<()> {
        Ok(())
    }

    async fn get_project_usage(&self, _path: &Path, _id: u32) -> Result<u64> {
        Ok(0)
    }
}

/// Drives quota assignment for volumes against a [`QuotaBackend`].
#[derive(Clone)]
pub struct QuotaManager {
    backend: Arc<dyn QuotaBackend>,
    default_size: Option<String>,
}

impl QuotaManager {
    /// Create a manager with the pool's default volume size (its `volume.size` config).
    pub fn new(backend: Arc<dyn QuotaBackend>, default_size: Option<String>) -> Self {
        Self { backend, default_size }
    }

    /// Whether the filesystem backing `path` supports project quotas.
    pub async fn supported(&self, path: &Path) -> bool {
        self.backend.supported(path).await
    }

    fn require_vol_id(path: &Path, vol_id: i64) -> Result<()> {
        // A zero id means the metadata store does not know this volume;
        // applying quota would attach the limit to an unrelated project.
        if vol_id == 0 {
            return Err(StorageError::MissingVolumeId { path: path.to_path_buf() });
        }
        Ok(())
    }

    /// Assign `path` to the volume's quota project with no byte limit.
    pub async fn init(&self, path: &Path, vol_id: i64) -> Result<()> {
        Self::require_vol_id(path, vol_id)?;

        if !self.backend.supported(path).await {
            return Ok(());
        }

        self.backend.set_project(path, project_id(vol_id)).await
    }

    /// Set the volume's byte limit, resolving `size` against the pool default.
    ///
    /// An empty size with no pool default is a successful no-op.
    pub async fn set(&self, path: &Path, vol_id: i64, size: &str) -> Result<()> {
        Self::require_vol_id(path, vol_id)?;

        let size = match (size, self.default_size.as_deref()) {
            ("" | "0", Some(default)) => default,
            (size, _) => size,
        };

        if size.is_empty() {
            return Ok(());
        }

        let bytes = units::parse_byte_size(size)?;

        if !self.backend.supported(path).await {
            if bytes > 0 {
                warn!(path = %path.display(), "backing filesystem does not support project quotas, size limit unenforced");
            }
            return Ok(());
        }

        debug!(path = %path.display(), project = project_id(vol_id), bytes, "setting project quota");
        self.backend.set_project_quota(path, project_id(vol_id), bytes).await
    }

    /// Clear the path's project assignment and zero the volume's limit.
    pub async fn delete(&self, path: &Path, vol_id: i64) -> Result<()> {
        Self::require_vol_id(path, vol_id)?;

        if !self.backend.supported(path).await {
            return Ok(());
        }

        self.backend.set_project(path, 0).await?;
        self.backend.set_project_quota(path, project_id(vol_id), 0).await
    }

    /// Bytes used by the volume's project, or `None` when quotas are unsupported.
    pub async fn usage(&self, path: &Path, vol_id: i64) -> Result<Option<u64>> {
        if !self.backend.supported(path).await {
            return Ok(None);
        }

        Self::require_vol_id(path, vol_id)?;
        let used = self.backend.get_project_usage(path, project_id(vol_id)).await?;
        Ok(Some(used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Recording fake backend.
    #[derive(Default)]
    struct FakeBackend {
        projects: Mutex<HashMap<PathBuf, u32>>,
        limits: Mutex<HashMap<u32, u64>>,
    }

    #[async_trait]
    impl QuotaBackend for FakeBackend {
        async fn supported(&self, _path: &Path) -> bool {
            true
        }

        async fn set_project(&self, path: &Path, id: u32) -> Result<()> {
            self.projects.lock().unwrap().insert(path.to_path_buf(), id);
            Ok(())
        }

        async fn set_project_quota(&self, _path: &Path, id: u32, bytes: u64) -> Result<()> {
            self.limits.lock().unwrap().insert(id, bytes);
            Ok(())
        }

        async fn get_project_usage(&self, _path: &Path, _id: u32) -> Result<u64> {
            Ok(4096)
        }
    }

    #[test]
    fn test_project_id_offset() {
        assert_eq!(project_id(1), 10_001);
        assert_eq!(project_id(41), 10_041);
    }

    #[tokio::test]
    async fn test_zero_vol_id_is_fatal() {
        let manager = QuotaManager::new(Arc::new(FakeBackend::default()), None);
        let path = Path::new("/tmp/vol");

        assert!(matches!(
            manager.init(path, 0).await,
            Err(StorageError::MissingVolumeId { .. })
        ));
        assert!(matches!(
            manager.set(path, 0, "1MiB").await,
            Err(StorageError::MissingVolumeId { .. })
        ));
        assert!(matches!(
            manager.delete(path, 0).await,
            Err(StorageError::MissingVolumeId { .. })
        ));
    }

    #[tokio::test]
    async fn test_init_set_delete_cycle() {
        let backend = Arc::new(FakeBackend::default());
        let manager = QuotaManager::new(backend.clone(), None);
        let path = Path::new("/tmp/vol");

        manager.init(path, 7).await.unwrap();
        assert_eq!(backend.projects.lock().unwrap().get(path), Some(&10_007));

        manager.set(path, 7, "1MiB").await.unwrap();
        assert_eq!(backend.limits.lock().unwrap().get(&10_007), Some(&(1024 * 1024)));

        manager.delete(path, 7).await.unwrap();
        assert_eq!(backend.projects.lock().unwrap().get(path), Some(&0));
        assert_eq!(backend.limits.lock().unwrap().get(&10_007), Some(&0));
    }

    #[tokio::test]
    async fn test_set_falls_back_to_pool_default() {
        let backend = Arc::new(FakeBackend::default());
        let manager = QuotaManager::new(backend.clone(), Some("2MiB".to_string()));
        let path = Path::new("/tmp/vol");

        manager.set(path, 3, "").await.unwrap();
        assert_eq!(backend.limits.lock().unwrap().get(&10_003), Some(&(2 * 1024 * 1024)));

        // Explicit size wins over the default.
        manager.set(path, 3, "1MiB").await.unwrap();
        assert_eq!(backend.limits.lock().unwrap().get(&10_003), Some(&(1024 * 1024)));
    }

    #[tokio::test]
    async fn test_set_without_any_size_is_noop() {
        let backend = Arc::new(FakeBackend::default());
        let manager = QuotaManager::new(backend.clone(), None);

        manager.set(Path::new("/tmp/vol"), 3, "").await.unwrap();
        assert!(backend.limits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_backend_degrades_to_success() {
        let manager = QuotaManager::new(Arc::new(UnsupportedQuota), None);
        let path = Path::new("/tmp/vol");

        manager.init(path, 5).await.unwrap();
        manager.set(path, 5, "1GiB").await.unwrap();
        manager.delete(path, 5).await.unwrap();
        assert_eq!(manager.usage(path, 5).await.unwrap(), None);
    }
}
