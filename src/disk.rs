//! Raw disk-image tooling for block volumes.

use crate::error::{Result, StorageError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, instrument};

/// External disk-image tooling consumed by the driver.
#[async_trait]
pub trait DiskTool: Send + Sync {
    /// Create a sparse raw image of `bytes` at `path`.
    async fn create_raw(&self, path: &Path, bytes: u64) -> Result<()>;

    /// Resize the raw image at `path` to `bytes`.
    async fn resize_raw(&self, path: &Path, bytes: u64) -> Result<()>;
}

/// `qemu-img` backed implementation.
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    /// Use `qemu-img` from `$PATH`.
    pub fn new() -> Self {
        Self { binary: PathBuf::from("qemu-img") }
    }

    /// Use a specific `qemu-img` binary.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        debug!(binary = %self.binary.display(), ?args, "running qemu-img");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| StorageError::ProcessFailed {
                program: self.binary.display().to_string(),
                reason: format!("failed to spawn: {}", e),
            })?;

        if !output.status.success() {
            return Err(StorageError::ProcessFailed {
                program: self.binary.display().to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiskTool for QemuImg {
    #[instrument(skip(self))]
    async fn create_raw(&self, path: &Path, bytes: u64) -> Result<()> {
        let size = bytes.to_string();
        self.run(&["create", "-f", "raw", &path.to_string_lossy(), &size]).await
    }

    #[instrument(skip(self))]
    async fn resize_raw(&self, path: &Path, bytes: u64) -> Result<()> {
        let size = bytes.to_string();
        self.run(&["resize", "-f", "raw", &path.to_string_lossy(), &size]).await
    }
}
