//! Backup archive handling: compression detection and selective tar extraction.

use crate::error::{Result, StorageError};
use flate2::read::GzDecoder;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::debug;

/// Seekable stream holding backup source data.
pub trait BackupSource: Read + Seek + Send {}

impl<T: Read + Seek + Send + ?Sized> BackupSource for T {}

/// Compression applied to a backup tarball.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Bzip2,
    Zstd,
}

impl Compression {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Bzip2 => "bzip2",
            Self::Zstd => "zstd",
        }
    }
}

/// Detect the compression of a backup stream from its magic bytes.
///
/// Leaves the stream position unspecified; callers rewind before extraction.
pub fn detect_compression(src: &mut dyn BackupSource) -> Result<Compression> {
    src.seek(SeekFrom::Start(0))
        .map_err(|e| StorageError::io("seek backup stream", "<backup>", e))?;

    let mut magic = [0u8; 6];
    let n = read_up_to(src, &mut magic)
        .map_err(|e| StorageError::io("read backup stream", "<backup>", e))?;
    let magic = &magic[..n];

    let compression = if magic.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else if magic.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        Compression::Xz
    } else if magic.starts_with(b"BZh") {
        Compression::Bzip2
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Compression::Zstd
    } else {
        Compression::None
    };

    debug!(compression = compression.as_str(), "detected backup compression");
    Ok(compression)
}

fn read_up_to(src: &mut dyn BackupSource, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Extract the archive entries under `prefix` into `dest`, stripping `strip`
/// leading path components. Returns the paths created directly under `dest`.
pub fn unpack_prefix(
    src: &mut dyn BackupSource,
    compression: Compression,
    prefix: &str,
    strip: usize,
    dest: &Path,
) -> Result<Vec<PathBuf>> {
    src.seek(SeekFrom::Start(0))
        .map_err(|e| StorageError::io("seek backup stream", "<backup>", e))?;

    let reader: Box<dyn Read + '_> = match compression {
        Compression::None => Box::new(&mut *src),
        Compression::Gzip => Box::new(GzDecoder::new(&mut *src)),
        other => {
            return Err(StorageError::NotImplemented {
                feature: format!("{} compressed backups", other.as_str()),
            })
        }
    };

    let mut archive = Archive::new(reader);
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);

    let prefix = Path::new(prefix);
    let mut created = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| StorageError::io("read backup archive", dest, e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| StorageError::io("read backup entry", dest, e))?;
        let entry_path = entry
            .path()
            .map_err(|e| StorageError::io("read backup entry path", dest, e))?
            .into_owned();

        if !entry_path.starts_with(prefix) {
            continue;
        }

        let stripped: PathBuf = entry_path.components().skip(strip).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }

        // Entry names come from the archive; anything that is not a plain
        // relative path could land outside `dest`.
        if stripped.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(StorageError::ConfigInvalid {
                reason: format!("unsafe path {:?} in backup archive", entry_path),
            });
        }

        if stripped.components().count() == 1 {
            created.push(dest.join(&stripped));
        }

        let target = dest.join(&stripped);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::io("create extraction directory", parent, e))?;
        }

        entry
            .unpack(&target)
            .map_err(|e| StorageError::io("unpack backup entry", &target, e))?;
    }

    Ok(created)
}
