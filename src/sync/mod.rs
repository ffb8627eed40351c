//! Tree synchronization primitive.
//!
//! [`TreeSync`] is the single byte-movement interface used by the driver for
//! local copies, snapshot materialization, backup staging and migration
//! streams. [`FsTreeSync`] is the built-in implementation: local copies are
//! full tree mirrors, and remote transfers stream the tree as
//! length-prefixed JSON entry headers followed by raw file bytes, ending in
//! an explicit end frame so several transfers can share one connection.

use crate::error::{Result, StorageError};
use crate::operation::ProgressSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const FILE_CHUNK_SIZE: usize = 64 * 1024;
const MAX_HEADER_SIZE: u32 = 1024 * 1024;

/// Bidirectional byte connection used by migration transfers.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Connection for T {}

/// Whole-tree synchronization primitive.
#[async_trait]
pub trait TreeSync: Send + Sync {
    /// Stream the tree rooted at `path` to the peer as one logical unit.
    async fn send(
        &self,
        label: &str,
        path: &Path,
        conn: &mut dyn Connection,
        progress: Option<&ProgressSink>,
        features: &[String],
        bwlimit: Option<&str>,
    ) -> Result<()>;

    /// Receive one logical unit from the peer into `path`, mirroring it:
    /// destination entries absent from the unit are removed.
    async fn recv(
        &self,
        path: &Path,
        conn: &mut dyn Connection,
        progress: Option<&ProgressSink>,
        features: &[String],
    ) -> Result<()>;

    /// Mirror the tree at `src` into `dst`, removing extraneous destination
    /// entries. Returns the number of file bytes copied.
    async fn local_copy(
        &self,
        src: &Path,
        dst: &Path,
        bwlimit: Option<&str>,
        preserve_xattrs: bool,
    ) -> Result<u64>;
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    Dir,
    File,
    Symlink,
    End,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    kind: EntryKind,
    path: String,
    mode: u32,
    size: u64,
    link_target: Option<String>,
}

impl EntryHeader {
    fn end() -> Self {
        Self { kind: EntryKind::End, path: String::new(), mode: 0, size: 0, link_target: None }
    }
}

/// Built-in filesystem transport.
#[derive(Debug, Default, Clone)]
pub struct FsTreeSync;

impl FsTreeSync {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TreeSync for FsTreeSync {
    async fn send(
        &self,
        label: &str,
        path: &Path,
        conn: &mut dyn Connection,
        progress: Option<&ProgressSink>,
        _features: &[String],
        bwlimit: Option<&str>,
    ) -> Result<()> {
        if bwlimit.is_some() {
            debug!(label, "bwlimit is not enforced by the built-in transport");
        }

        let root = path.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || collect_entries(&root))
            .await
            .map_err(|e| StorageError::Internal(format!("tree walk task failed: {}", e)))?
            .map_err(|e| StorageError::io("walk tree", path, e))?;

        debug!(label, entries = entries.len(), "sending tree");

        for entry in entries {
            write_header(conn, &entry.header).await?;

            if entry.header.kind == EntryKind::File {
                send_file_contents(conn, &entry.abs, entry.header.size, progress).await?;
            }
        }

        write_header(conn, &EntryHeader::end()).await?;
        conn.flush().await.map_err(|e| StorageError::io("flush connection", path, e))?;
        Ok(())
    }

    async fn recv(
        &self,
        path: &Path,
        conn: &mut dyn Connection,
        progress: Option<&ProgressSink>,
        _features: &[String],
    ) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| StorageError::io("create receive root", path, e))?;

        let mut received: HashSet<PathBuf> = HashSet::new();
        loop {
            let header = read_header(conn, path).await?;
            if header.kind == EntryKind::End {
                break;
            }

            let dest = safe_join(path, &header.path)?;
            received.insert(PathBuf::from(&header.path));
            match header.kind {
                EntryKind::Dir => {
                    tokio::fs::create_dir_all(&dest)
                        .await
                        .map_err(|e| StorageError::io("create directory", &dest, e))?;
                    set_mode(&dest, header.mode).await?;
                }
                EntryKind::File => {
                    recv_file_contents(conn, &dest, header.size, progress).await?;
                    set_mode(&dest, header.mode).await?;
                }
                EntryKind::Symlink => {
                    let target = header.link_target.ok_or_else(|| {
                        StorageError::Protocol("symlink entry without target".to_string())
                    })?;
                    if tokio::fs::symlink_metadata(&dest).await.is_ok() {
                        let _ = tokio::fs::remove_file(&dest).await;
                    }
                    #[cfg(unix)]
                    tokio::fs::symlink(&target, &dest)
                        .await
                        .map_err(|e| StorageError::io("create symlink", &dest, e))?;
                }
                EntryKind::End => unreachable!(),
            }
        }

        // The sender's tree is authoritative: entries it did not stream in
        // this unit go away, same as local_copy.
        let root = path.to_path_buf();
        tokio::task::spawn_blocking(move || prune_unreceived(&root, &root, &received))
            .await
            .map_err(|e| StorageError::Internal(format!("prune task failed: {}", e)))?
            .map_err(|e| StorageError::io("prune tree", path, e))?;

        Ok(())
    }

    async fn local_copy(
        &self,
        src: &Path,
        dst: &Path,
        bwlimit: Option<&str>,
        _preserve_xattrs: bool,
    ) -> Result<u64> {
        if bwlimit.is_some() {
            debug!("bwlimit is not enforced by the built-in transport");
        }

        let src_buf = src.to_path_buf();
        let dst_buf = dst.to_path_buf();
        tokio::task::spawn_blocking(move || mirror_tree(&src_buf, &dst_buf))
            .await
            .map_err(|e| StorageError::Internal(format!("copy task failed: {}", e)))?
            .map_err(|e| StorageError::io("copy tree", src, e))
    }
}

struct SendEntry {
    abs: PathBuf,
    header: EntryHeader,
}

/// Walk `root` depth-first, parents before children.
fn collect_entries(root: &Path) -> std::io::Result<Vec<SendEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut children: Vec<_> =
            std::fs::read_dir(&dir)?.collect::<std::io::Result<Vec<_>>>()?;
        children.sort_by_key(|e| e.file_name());

        for child in children {
            let abs = child.path();
            let meta = std::fs::symlink_metadata(&abs)?;
            let rel = abs
                .strip_prefix(root)
                .expect("walked path is under root")
                .to_string_lossy()
                .into_owned();
            let mode = file_mode(&meta);

            if meta.file_type().is_symlink() {
                let target = std::fs::read_link(&abs)?.to_string_lossy().into_owned();
                out.push(SendEntry {
                    abs,
                    header: EntryHeader {
                        kind: EntryKind::Symlink,
                        path: rel,
                        mode,
                        size: 0,
                        link_target: Some(target),
                    },
                });
            } else if meta.is_dir() {
                out.push(SendEntry {
                    abs: abs.clone(),
                    header: EntryHeader {
                        kind: EntryKind::Dir,
                        path: rel,
                        mode,
                        size: 0,
                        link_target: None,
                    },
                });
                stack.push(abs);
            } else {
                out.push(SendEntry {
                    abs,
                    header: EntryHeader {
                        kind: EntryKind::File,
                        path: rel,
                        mode,
                        size: meta.len(),
                        link_target: None,
                    },
                });
            }
        }
    }

    Ok(out)
}

fn file_mode(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0o644
    }
}

async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| StorageError::io("set permissions", path, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

/// Join a peer-supplied relative path onto `root`, rejecting traversal.
fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    for component in rel_path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(StorageError::Protocol(format!(
                    "illegal path in stream: {:?}",
                    rel
                )))
            }
        }
    }
    Ok(root.join(rel_path))
}

async fn write_header(conn: &mut dyn Connection, header: &EntryHeader) -> Result<()> {
    let bytes = serde_json::to_vec(header)
        .map_err(|e| StorageError::Internal(format!("failed to encode entry header: {}", e)))?;

    conn.write_u32(bytes.len() as u32)
        .await
        .map_err(|e| StorageError::io("write frame length", "<connection>", e))?;
    conn.write_all(&bytes)
        .await
        .map_err(|e| StorageError::io("write frame", "<connection>", e))?;
    Ok(())
}

async fn read_header(conn: &mut dyn Connection, root: &Path) -> Result<EntryHeader> {
    let len = conn
        .read_u32()
        .await
        .map_err(|e| StorageError::io("read frame length", root, e))?;
    if len > MAX_HEADER_SIZE {
        return Err(StorageError::Protocol(format!("entry header too large: {} bytes", len)));
    }

    let mut buf = vec![0u8; len as usize];
    conn.read_exact(&mut buf)
        .await
        .map_err(|e| StorageError::io("read frame", root, e))?;

    serde_json::from_slice(&buf)
        .map_err(|e| StorageError::Protocol(format!("invalid entry header: {}", e)))
}

async fn send_file_contents(
    conn: &mut dyn Connection,
    path: &Path,
    size: u64,
    progress: Option<&ProgressSink>,
) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StorageError::io("open file", path, e))?;

    let mut remaining = size;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
        file.read_exact(&mut buf[..want])
            .await
            .map_err(|e| StorageError::io("read file", path, e))?;
        conn.write_all(&buf[..want])
            .await
            .map_err(|e| StorageError::io("write file data", path, e))?;

        remaining -= want as u64;
        if let Some(sink) = progress {
            sink.add_bytes(want as u64);
        }
    }

    Ok(())
}

async fn recv_file_contents(
    conn: &mut dyn Connection,
    path: &Path,
    size: u64,
    progress: Option<&ProgressSink>,
) -> Result<()> {
    // A directory in the way of an incoming file must give way, the sender's
    // tree is authoritative.
    if let Ok(meta) = tokio::fs::symlink_metadata(path).await {
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| StorageError::io("replace directory", path, e))?;
        }
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| StorageError::io("create file", path, e))?;

    let mut remaining = size;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
        conn.read_exact(&mut buf[..want])
            .await
            .map_err(|e| StorageError::io("read file data", path, e))?;
        file.write_all(&buf[..want])
            .await
            .map_err(|e| StorageError::io("write file", path, e))?;

        remaining -= want as u64;
        if let Some(sink) = progress {
            sink.add_bytes(want as u64);
        }
    }

    file.flush().await.map_err(|e| StorageError::io("flush file", path, e))?;
    Ok(())
}

/// Remove everything under `dir` whose root-relative path is not in `keep`.
fn prune_unreceived(root: &Path, dir: &Path, keep: &HashSet<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let abs = entry.path();
        let Ok(rel) = abs.strip_prefix(root) else { continue };

        if !keep.contains(rel) {
            if std::fs::symlink_metadata(&abs)?.is_dir() {
                std::fs::remove_dir_all(&abs)?;
            } else {
                std::fs::remove_file(&abs)?;
            }
        } else if std::fs::symlink_metadata(&abs)?.is_dir() {
            prune_unreceived(root, &abs, keep)?;
        }
    }

    Ok(())
}

/// Mirror `src` into `dst`: copy everything, prune extraneous destination
/// entries, preserve permissions and symlinks. Returns file bytes copied.
fn mirror_tree(src: &Path, dst: &Path) -> std::io::Result<u64> {
    if !dst.exists() {
        std::fs::create_dir_all(dst)?;
    }

    let mut copied = 0u64;
    let mut src_names = std::collections::HashSet::new();

    let mut children: Vec<_> = std::fs::read_dir(src)?.collect::<std::io::Result<Vec<_>>>()?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let name = child.file_name();
        src_names.insert(name.clone());

        let src_path = child.path();
        let dst_path = dst.join(&name);
        let meta = std::fs::symlink_metadata(&src_path)?;

        // Clear a destination entry of mismatched type.
        if let Ok(dst_meta) = std::fs::symlink_metadata(&dst_path) {
            let same_kind = dst_meta.file_type().is_dir() == meta.file_type().is_dir()
                && dst_meta.file_type().is_symlink() == meta.file_type().is_symlink();
            if !same_kind {
                if dst_meta.is_dir() {
                    std::fs::remove_dir_all(&dst_path)?;
                } else {
                    std::fs::remove_file(&dst_path)?;
                }
            }
        }

        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&src_path)?;
            if std::fs::symlink_metadata(&dst_path).is_ok() {
                std::fs::remove_file(&dst_path)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dst_path)?;
        } else if meta.is_dir() {
            copied += mirror_tree(&src_path, &dst_path)?;
            std::fs::set_permissions(&dst_path, meta.permissions())?;
        } else {
            copied += std::fs::copy(&src_path, &dst_path)?;
        }
    }

    // Prune what the source does not have.
    for entry in std::fs::read_dir(dst)? {
        let entry = entry?;
        if !src_names.contains(&entry.file_name()) {
            let path = entry.path();
            if std::fs::symlink_metadata(&path)?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_local_copy_mirrors_and_prunes() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");

        write(&src.join("a.txt"), "alpha");
        write(&src.join("sub/b.txt"), "beta");
        write(&dst.join("stale.txt"), "leftover");
        write(&dst.join("sub/also-stale.txt"), "leftover");

        let sync = FsTreeSync::new();
        let copied = sync.local_copy(&src, &dst, None, true).await.unwrap();

        assert_eq!(copied, 9);
        assert_eq!(read(&dst.join("a.txt")), "alpha");
        assert_eq!(read(&dst.join("sub/b.txt")), "beta");
        assert!(!dst.join("stale.txt").exists());
        assert!(!dst.join("sub/also-stale.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_copy_preserves_symlinks_and_modes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");

        write(&src.join("bin/tool"), "#!/bin/sh\n");
        std::fs::set_permissions(&src.join("bin/tool"), std::fs::Permissions::from_mode(0o755))
            .unwrap();
        std::os::unix::fs::symlink("bin/tool", src.join("tool-link")).unwrap();

        let sync = FsTreeSync::new();
        sync.local_copy(&src, &dst, None, true).await.unwrap();

        let mode = std::fs::metadata(dst.join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        let link = std::fs::read_link(dst.join("tool-link")).unwrap();
        assert_eq!(link, PathBuf::from("bin/tool"));
    }

    #[tokio::test]
    async fn test_send_recv_round_trip_over_duplex() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");

        write(&src.join("a.txt"), "alpha");
        write(&src.join("deep/nested/b.txt"), "beta");

        let (mut tx, mut rx) = tokio::io::duplex(256 * 1024);
        let sync = FsTreeSync::new();

        let send_src = src.clone();
        let sender = tokio::spawn(async move {
            let sync = FsTreeSync::new();
            sync.send("unit", &send_src, &mut tx, None, &[], None).await
        });

        sync.recv(&dst, &mut rx, None, &[]).await.unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(read(&dst.join("a.txt")), "alpha");
        assert_eq!(read(&dst.join("deep/nested/b.txt")), "beta");
    }

    #[tokio::test]
    async fn test_multiple_units_share_one_connection() {
        let tmp = TempDir::new().unwrap();
        let one = tmp.path().join("one");
        let two = tmp.path().join("two");
        write(&one.join("1.txt"), "one");
        write(&two.join("2.txt"), "two");

        let (mut tx, mut rx) = tokio::io::duplex(256 * 1024);

        let send_one = one.clone();
        let send_two = two.clone();
        let sender = tokio::spawn(async move {
            let sync = FsTreeSync::new();
            sync.send("one", &send_one, &mut tx, None, &[], None).await?;
            sync.send("two", &send_two, &mut tx, None, &[], None).await
        });

        let sync = FsTreeSync::new();
        let dst_one = tmp.path().join("dst-one");
        let dst_two = tmp.path().join("dst-two");
        sync.recv(&dst_one, &mut rx, None, &[]).await.unwrap();
        sync.recv(&dst_two, &mut rx, None, &[]).await.unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(read(&dst_one.join("1.txt")), "one");
        assert_eq!(read(&dst_two.join("2.txt")), "two");
    }

    #[tokio::test]
    async fn test_recv_prunes_entries_absent_from_unit() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");

        write(&src.join("kept.txt"), "kept");
        write(&dst.join("stale.txt"), "stale");
        write(&dst.join("stale-dir/nested.txt"), "stale");

        let (mut tx, mut rx) = tokio::io::duplex(256 * 1024);
        let send_src = src.clone();
        let sender = tokio::spawn(async move {
            let sync = FsTreeSync::new();
            sync.send("unit", &send_src, &mut tx, None, &[], None).await
        });

        let sync = FsTreeSync::new();
        sync.recv(&dst, &mut rx, None, &[]).await.unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(read(&dst.join("kept.txt")), "kept");
        assert!(!dst.join("stale.txt").exists());
        assert!(!dst.join("stale-dir").exists());
    }

    #[test]
    fn test_safe_join_rejects_traversal() {
        let root = Path::new("/data");
        assert!(safe_join(root, "ok/file.txt").is_ok());
        assert!(safe_join(root, "../escape").is_err());
        assert!(safe_join(root, "/absolute").is_err());
    }
}
