//! Mount plumbing for pool roots and snapshot protection.

use crate::error::{Result, StorageError};
use std::path::Path;
#[cfg(target_os = "linux")]
use tracing::debug;

/// Kernel mount operations consumed by the driver.
pub trait Mounter: Send + Sync {
    /// Bind mount `src` onto `dst`.
    fn bind_mount(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Place a read-only bind mount on top of `path` to guard against writes.
    fn mount_read_only(&self, path: &Path) -> Result<()>;

    /// Detach whatever is mounted at `path`, repeating until nothing remains
    /// (defends against stacked mounts). Returns whether anything was unmounted.
    fn unmount_all(&self, path: &Path) -> Result<bool>;

    /// Whether `dst` currently has a mount on it.
    fn is_mounted(&self, dst: &Path) -> bool;
}

/// Mounter using the host kernel (Linux only).
pub struct SysMounter;

#[cfg(target_os = "linux")]
mod sys {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn cstring(path: &Path) -> Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| StorageError::Internal(format!("path contains NUL: {:?}", path)))
    }

    fn mount(src: &Path, dst: &Path, flags: libc::c_ulong) -> Result<()> {
        let src_c = cstring(src)?;
        let dst_c = cstring(dst)?;

        // fstype is ignored for bind mounts and remounts.
        let rc = unsafe {
            libc::mount(
                src_c.as_ptr(),
                dst_c.as_ptr(),
                std::ptr::null(),
                flags,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(StorageError::io("mount", dst, std::io::Error::last_os_error()));
        }
        Ok(())
    }

    impl Mounter for SysMounter {
        fn bind_mount(&self, src: &Path, dst: &Path) -> Result<()> {
            debug!(src = %src.display(), dst = %dst.display(), "bind mounting");
            mount(src, dst, libc::MS_BIND)
        }

        fn mount_read_only(&self, path: &Path) -> Result<()> {
            mount(path, path, libc::MS_BIND)?;
            mount(path, path, libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY)
        }

        fn unmount_all(&self, path: &Path) -> Result<bool> {
            let path_c = cstring(path)?;
            let mut unmounted = false;

            loop {
                let rc = unsafe { libc::umount2(path_c.as_ptr(), 0) };
                if rc == 0 {
                    unmounted = true;
                    continue;
                }

                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    // EINVAL: not a mount point; ENOENT: path gone. Both mean done.
                    Some(libc::EINVAL) | Some(libc::ENOENT) => return Ok(unmounted),
                    _ => return Err(StorageError::io("unmount", path, err)),
                }
            }
        }

        fn is_mounted(&self, dst: &Path) -> bool {
            let Ok(mountinfo) = std::fs::read_to_string("/proc/self/mountinfo") else {
                return false;
            };
            let needle = dst.to_string_lossy();
            mountinfo
                .lines()
                .filter_map(|line| line.split_whitespace().nth(4))
                .any(|mount_point| mount_point == needle)
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for SysMounter {
    fn bind_mount(&self, _src: &Path, _dst: &Path) -> Result<()> {
        Err(StorageError::NotImplemented { feature: "bind mounts on this platform".to_string() })
    }

    fn mount_read_only(&self, _path: &Path) -> Result<()> {
        Err(StorageError::NotImplemented { feature: "bind mounts on this platform".to_string() })
    }

    fn unmount_all(&self, _path: &Path) -> Result<bool> {
        Err(StorageError::NotImplemented { feature: "bind mounts on this platform".to_string() })
    }

    fn is_mounted(&self, _dst: &Path) -> bool {
        false
    }
}
