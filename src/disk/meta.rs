//! Cache metadata stored on the disk file itself.
//!
//! The record lives in the `user.bootc.meta` extended attribute as JSON. On
//! filesystems without user xattrs it is written to a sidecar file next to
//! the disk (`<disk>.meta.json`) with the same schema.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use xattr::FileExt;

/// Extended attribute holding the serialized [`DiskMeta`].
pub const IMAGE_META_XATTR: &str = "user.bootc.meta";

const SIDECAR_SUFFIX: &str = ".meta.json";

/// What the cache knows about how a disk was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskMeta {
    /// Digest of the container image the disk was installed from.
    pub image_digest: String,
}

/// Outcome of looking up metadata for a cache entry.
#[derive(Debug)]
pub enum MetaLookup {
    Found(DiskMeta),
    /// No disk, or a disk with no record attached.
    Missing,
    /// A record exists but could not be read or parsed.
    Corrupt(String),
}

/// Where a record ended up when written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaLocation {
    Xattr,
    Sidecar(PathBuf),
}

pub fn sidecar_path(disk: &Path) -> PathBuf {
    let mut name = disk.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Read the record for `disk`. Never fails; defects are reported as
/// [`MetaLookup::Corrupt`] so the caller can treat them as a cache miss.
pub fn read(disk: &Path) -> MetaLookup {
    let file = match File::open(disk) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return MetaLookup::Missing,
        Err(e) => return MetaLookup::Corrupt(format!("opening {}: {e}", disk.display())),
    };

    match file.get_xattr(IMAGE_META_XATTR) {
        Ok(Some(buf)) => parse(&buf),
        Ok(None) => read_sidecar(disk),
        Err(e) if xattrs_unsupported(&e) => read_sidecar(disk),
        Err(e) => MetaLookup::Corrupt(format!("reading {IMAGE_META_XATTR}: {e}")),
    }
}

/// Attach `meta` to the open disk file at `disk`.
///
/// Falls back to a sidecar file when the filesystem rejects user xattrs.
pub fn write(file: &File, disk: &Path, meta: &DiskMeta) -> Result<MetaLocation> {
    let buf = serde_json::to_vec(meta)?;
    match file.set_xattr(IMAGE_META_XATTR, &buf) {
        Ok(()) => Ok(MetaLocation::Xattr),
        Err(e) if xattrs_unsupported(&e) => {
            let sidecar = sidecar_path(disk);
            fs::write(&sidecar, &buf)
                .with_context(|| format!("failed to write {}", sidecar.display()))?;
            Ok(MetaLocation::Sidecar(sidecar))
        }
        Err(e) => Err(e).with_context(|| format!("failed to set xattr on {}", disk.display())),
    }
}

/// Remove `disk` and any sidecar record, ignoring files that do not exist.
pub fn remove_entry(disk: &Path) -> Result<()> {
    for path in [disk.to_path_buf(), sidecar_path(disk)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    }
    Ok(())
}

fn read_sidecar(disk: &Path) -> MetaLookup {
    let sidecar = sidecar_path(disk);
    match fs::read(&sidecar) {
        Ok(buf) => parse(&buf),
        Err(e) if e.kind() == io::ErrorKind::NotFound => MetaLookup::Missing,
        Err(e) => MetaLookup::Corrupt(format!("reading {}: {e}", sidecar.display())),
    }
}

fn parse(buf: &[u8]) -> MetaLookup {
    match serde_json::from_slice::<DiskMeta>(buf) {
        Ok(meta) => MetaLookup::Found(meta),
        Err(e) => MetaLookup::Corrupt(format!(
            "failed to parse serialized meta ({}): {e}",
            String::from_utf8_lossy(buf)
        )),
    }
}

fn xattrs_unsupported(err: &io::Error) -> bool {
    if !xattr::SUPPORTED_PLATFORM || err.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    matches!(err.raw_os_error(), Some(code) if code == libc::ENOTSUP || code == libc::EOPNOTSUPP)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Attach raw bytes as the record for `disk`, the same way `write` would.
    pub(crate) fn write_raw(disk: &Path, buf: &[u8]) {
        match xattr::set(disk, IMAGE_META_XATTR, buf) {
            Ok(()) => {}
            Err(e) if xattrs_unsupported(&e) => fs::write(sidecar_path(disk), buf).unwrap(),
            Err(e) => panic!("setting test xattr: {e}"),
        }
    }
}
