//! Shared test fixtures: an isolated data directory and fake backends.

#![allow(dead_code)]

use async_trait::async_trait;
use dirpool::disk::DiskTool;
use dirpool::mount::Mounter;
use dirpool::quota::QuotaBackend;
use dirpool::operation::ProgressSink;
use dirpool::sync::{Connection, FsTreeSync, TreeSync};
use dirpool::{
    ContentType, DirDriver, DriverBackends, Result, StorageError, Volume, VolumeIdResolver,
    VolumeType,
};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// One isolated data directory per test binary, installed before any path
// derivation happens.
static DATA_DIR: Lazy<TempDir> = Lazy::new(|| {
    let tmp = TempDir::new().expect("create test data dir");
    std::env::set_var("DIRPOOL_DATA_DIR", tmp.path());
    tmp
});

/// Recording quota backend that claims support.
#[derive(Default)]
pub struct FakeQuota {
    pub projects: Mutex<HashMap<PathBuf, u32>>,
    pub limits: Mutex<HashMap<u32, u64>>,
}

#[async_trait]
impl QuotaBackend for FakeQuota {
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

/// Resolver assigning sequential ids on first lookup, like a metadata store.
pub struct FakeIds {
    ids: Mutex<HashMap<String, i64>>,
    next: AtomicI64,
}

impl Default for FakeIds {
    fn default() -> Self {
        Self { ids: Mutex::new(HashMap::new()), next: AtomicI64::new(1) }
    }
}

impl FakeIds {
    pub fn id_of(&self, name: &str) -> Option<i64> {
        self.ids.lock().unwrap().get(name).copied()
    }
}

#[async_trait]
impl VolumeIdResolver for FakeIds {
    async fn volume_id(&self, _vol_type: VolumeType, name: &str) -> Result<i64> {
        let mut ids = self.ids.lock().unwrap();
        let next = &self.next;
        Ok(*ids
            .entry(name.to_string())
            .or_insert_with(|| next.fetch_add(1, Ordering::SeqCst)))
    }
}

/// Resolver for volumes the metadata store does not know.
pub struct ZeroIds;

#[async_trait]
impl VolumeIdResolver for ZeroIds {
    async fn volume_id(&self, _vol_type: VolumeType, _name: &str) -> Result<i64> {
        Ok(0)
    }
}

/// Disk tool creating sparse files instead of shelling out.
#[derive(Default)]
pub struct FakeDisk {
    pub resized: Mutex<Vec<(PathBuf, u64)>>,
}

#[async_trait]
impl DiskTool for FakeDisk {
    async fn create_raw(&self, path: &Path, bytes: u64) -> Result<()> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| StorageError::io("create image", path, e))?;
        file.set_len(bytes).await.map_err(|e| StorageError::io("size image", path, e))
    }

    async fn resize_raw(&self, path: &Path, bytes: u64) -> Result<()> {
        self.resized.lock().unwrap().push((path.to_path_buf(), bytes));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| StorageError::io("open image", path, e))?;
        file.set_len(bytes).await.map_err(|e| StorageError::io("size image", path, e))
    }
}

/// Transport that fails on the Nth call of a chosen method, delegating
/// everything else to the built-in transport.
#[derive(Default)]
pub struct FlakySync {
    inner: FsTreeSync,
    fail_local_copy_at: Option<u32>,
    fail_recv_at: Option<u32>,
    local_copies: AtomicU32,
    recvs: AtomicU32,
}

impl FlakySync {
    pub fn fail_local_copy_at(n: u32) -> Self {
        Self { fail_local_copy_at: Some(n), ..Self::default() }
    }

    pub fn fail_recv_at(n: u32) -> Self {
        Self { fail_recv_at: Some(n), ..Self::default() }
    }
}

#[async_trait]
impl TreeSync for FlakySync {
    async fn send(
        &self,
        label: &str,
        path: &Path,
        conn: &mut dyn Connection,
        progress: Option<&ProgressSink>,
        features: &[String],
        bwlimit: Option<&str>,
    ) -> Result<()> {
        self.inner.send(label, path, conn, progress, features, bwlimit).await
    }

    async fn recv(
        &self,
        path: &Path,
        conn: &mut dyn Connection,
        progress: Option<&ProgressSink>,
        features: &[String],
    ) -> Result<()> {
        let n = self.recvs.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_recv_at == Some(n) {
            return Err(StorageError::Internal("injected transfer failure".to_string()));
        }
        self.inner.recv(path, conn, progress, features).await
    }

    async fn local_copy(
        &self,
        src: &Path,
        dst: &Path,
        bwlimit: Option<&str>,
        preserve_xattrs: bool,
    ) -> Result<u64> {
        let n = self.local_copies.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_local_copy_at == Some(n) {
            return Err(StorageError::Internal("injected transfer failure".to_string()));
        }
        self.inner.local_copy(src, dst, bwlimit, preserve_xattrs).await
    }
}

/// Mounter that records read-only protections without touching the kernel.
#[derive(Default)]
pub struct NoopMounter {
    pub ro_mounts: Mutex<Vec<PathBuf>>,
}

impl Mounter for NoopMounter {
    fn bind_mount(&self, _src: &Path, _dst: &Path) -> Result<()> {
        Ok(())
    }

    fn mount_read_only(&self, path: &Path) -> Result<()> {
        self.ro_mounts.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn unmount_all(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }

    fn is_mounted(&self, _dst: &Path) -> bool {
        false
    }
}

/// A driver wired to fakes, plus handles to inspect them.
pub struct TestEnv {
    pub driver: DirDriver,
    pub quota: Arc<FakeQuota>,
    pub ids: Arc<FakeIds>,
    pub mounter: Arc<NoopMounter>,
}

pub fn test_driver(pool: &str) -> TestEnv {
    test_driver_with_config(pool, HashMap::new())
}

/// Pin the isolated data directory without building a driver. Needed by
/// tests that wire their own backends.
pub fn init_data_dir() {
    Lazy::force(&DATA_DIR);
}

pub fn test_driver_with_sync(pool: &str, sync: Arc<dyn TreeSync>) -> TestEnv {
    Lazy::force(&DATA_DIR);

    let quota = Arc::new(FakeQuota::default());
    let ids = Arc::new(FakeIds::default());
    let mounter = Arc::new(NoopMounter::default());
    let backends = DriverBackends {
        quota: quota.clone(),
        sync,
        ids: ids.clone(),
        disk: Arc::new(FakeDisk::default()),
        mounter: mounter.clone(),
    };

    TestEnv { driver: DirDriver::new(pool, HashMap::new(), backends), quota, ids, mounter }
}

pub fn test_driver_with_config(pool: &str, config: HashMap<String, String>) -> TestEnv {
    Lazy::force(&DATA_DIR);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let quota = Arc::new(FakeQuota::default());
    let ids = Arc::new(FakeIds::default());
    let mounter = Arc::new(NoopMounter::default());
    let backends = DriverBackends {
        quota: quota.clone(),
        sync: Arc::new(FsTreeSync::new()),
        ids: ids.clone(),
        disk: Arc::new(FakeDisk::default()),
        mounter: mounter.clone(),
    };

    TestEnv { driver: DirDriver::new(pool, config, backends), quota, ids, mounter }
}

pub fn fs_vol(pool: &str, name: &str) -> Volume {
    Volume::new(pool, VolumeType::Container, ContentType::Filesystem, name, HashMap::new())
}

pub fn block_vol(pool: &str, name: &str, config: HashMap<String, String>) -> Volume {
    Volume::new(pool, VolumeType::Vm, ContentType::Block, name, config)
}

pub fn write_file(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

pub fn read_file(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}
