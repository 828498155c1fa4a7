//! Local cache of disk images generated from bootable container images.
//!
//! One raw disk per image name lives in the cache directory. A disk is only
//! trusted when its attached [`meta::DiskMeta`] names the digest the caller
//! asks for; anything else is rebuilt. New disks are assembled under a
//! temporary name and renamed into place, so the final name only ever refers
//! to a complete disk.

pub mod installer;
pub mod meta;

pub use installer::{ContainerInstaller, DiskInstaller, LOOP_WRAPPER_ENTRYPOINT};
pub use meta::{DiskMeta, MetaLookup};

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_DISK_SIZE_BYTES;

/// Prefix of in-progress disks inside the cache directory.
pub const TEMP_DISK_PREFIX: &str = "podman-bootc-tempdisk";

const LOCKS_DIR: &str = ".locks";

/// Cache of installed disks keyed by image name, validated by digest.
pub struct DiskCache<I> {
    dir: PathBuf,
    disk_size: u64,
    installer: I,
}

impl<I: DiskInstaller> DiskCache<I> {
    pub fn new(dir: impl Into<PathBuf>, installer: I) -> Self {
        Self {
            dir: dir.into(),
            disk_size: DEFAULT_DISK_SIZE_BYTES,
            installer,
        }
    }

    /// Virtual capacity of newly built disks.
    pub fn with_disk_size(mut self, bytes: u64) -> Self {
        self.disk_size = bytes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic location of the cached disk for `image_name`.
    pub fn disk_path_for(&self, image_name: &str) -> PathBuf {
        self.dir.join(cache_file_name(image_name))
    }

    /// Return a disk for `image_name` built from `image_digest`, building it
    /// when the cached copy is absent, unreadable, or from another digest.
    pub fn get_or_create(&self, image_name: &str, image_digest: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cache directory {}", self.dir.display()))?;
        let disk_path = self.disk_path_for(image_name);
        let _lock = self.lock_entry(image_name)?;

        match meta::read(&disk_path) {
            MetaLookup::Found(found) => {
                debug!(
                    "previous disk digest: {} current digest: {}",
                    found.image_digest, image_digest
                );
                if found.image_digest == image_digest {
                    return Ok(disk_path);
                }
            }
            MetaLookup::Missing => discard(&disk_path),
            MetaLookup::Corrupt(reason) => {
                warn!("Discarding cached disk {}: {}", disk_path.display(), reason);
                discard(&disk_path);
            }
        }

        self.build(image_name, image_digest, &disk_path)
    }

    /// Install `image_name` into a fresh disk and publish it at `target`.
    ///
    /// On failure nothing under `target` changes and the temporary disk is
    /// removed.
    pub fn build(&self, image_name: &str, image_digest: &str, target: &Path) -> Result<PathBuf> {
        let temp_disk = tempfile::Builder::new()
            .prefix(TEMP_DISK_PREFIX)
            .tempfile_in(&self.dir)
            .with_context(|| format!("creating temporary disk in {}", self.dir.display()))?;
        // Sparse: only blocks the installer writes take space.
        temp_disk
            .as_file()
            .set_len(self.disk_size)
            .with_context(|| format!("sizing {}", temp_disk.path().display()))?;

        self.installer
            .install(image_name, temp_disk.path(), &self.dir)
            .with_context(|| format!("building disk for {image_name}"))?;

        let record = DiskMeta {
            image_digest: image_digest.to_string(),
        };
        let location = meta::write(temp_disk.as_file(), temp_disk.path(), &record)?;

        temp_disk
            .persist(target)
            .map_err(|e| {
                if let meta::MetaLocation::Sidecar(sidecar) = &location {
                    let _ = fs::remove_file(sidecar);
                }
                e.error
            })
            .with_context(|| format!("failed to rename to {}", target.display()))?;

        // The disk goes first: a reader that sees the new disk next to a stale
        // sidecar gets a digest mismatch and rebuilds, never a false hit.
        match location {
            meta::MetaLocation::Xattr => {
                let _ = fs::remove_file(meta::sidecar_path(target));
            }
            meta::MetaLocation::Sidecar(sidecar) => {
                let final_sidecar = meta::sidecar_path(target);
                fs::rename(&sidecar, &final_sidecar).with_context(|| {
                    format!("failed to rename to {}", final_sidecar.display())
                })?;
            }
        }

        info!("Published disk {} ({})", target.display(), image_digest);
        Ok(target.to_path_buf())
    }

    /// Serialize builders of the same cache entry, across processes too.
    fn lock_entry(&self, image_name: &str) -> Result<EntryLock> {
        let dir = self.dir.join(LOCKS_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.lock", cache_file_name(image_name)));

        // Never unlink lock files: a second process could then lock a fresh
        // inode at the same path while the first still holds the old one.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(EntryLock { file })
    }
}

/// Drop a stale entry. The rename at the end of a build replaces it anyway.
fn discard(disk_path: &Path) {
    if let Err(e) = meta::remove_entry(disk_path) {
        warn!("{e:#}");
    }
}

/// Cache filename for an image reference: path separators become `_`.
pub fn cache_file_name(image_name: &str) -> String {
    image_name.replace('/', "_")
}

/// Held while an entry is validated and rebuilt.
struct EntryLock {
    file: File,
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::error::VmrunError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const IMAGE: &str = "example.com/os:latest";
    const SIZE: u64 = 64 * 1024;

    fn cache<'a>(dir: &Path, engine: &'a FakeEngine) -> DiskCache<ContainerInstaller<'a>> {
        DiskCache::new(dir, ContainerInstaller::new(engine)).with_disk_size(SIZE)
    }

    fn digest_of(disk: &Path) -> String {
        match meta::read(disk) {
            MetaLookup::Found(m) => m.image_digest,
            other => panic!("expected metadata on {}, got {other:?}", disk.display()),
        }
    }

    /// Names in the cache dir other than the lock directory.
    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != LOCKS_DIR)
            .collect();
        names.sort();
        names
    }

    #[test]
    fn cache_path_replaces_separators() {
        let engine = FakeEngine::with_digest("sha256:aaa");
        let c = cache(Path::new("/cache"), &engine);
        assert_eq!(
            c.disk_path_for("quay.io/exampleos/someos:latest"),
            PathBuf::from("/cache/quay.io_exampleos_someos:latest")
        );
    }

    #[test]
    fn empty_cache_builds_once_and_records_digest() {
        let tmp = TempDir::new().unwrap();
        let engine = FakeEngine::with_digest("sha256:aaa");
        let c = cache(tmp.path(), &engine);

        let disk = c.get_or_create(IMAGE, "sha256:aaa").unwrap();

        assert_eq!(engine.runs.get(), 1);
        assert_eq!(disk, c.disk_path_for(IMAGE));
        assert_eq!(digest_of(&disk), "sha256:aaa");
        let bytes = fs::read(&disk).unwrap();
        assert_eq!(bytes.len() as u64, SIZE);
        assert!(bytes.starts_with(b"bootable disk"));
    }

    #[test]
    fn unchanged_digest_is_a_cache_hit() {
        let tmp = TempDir::new().unwrap();
        let engine = FakeEngine::with_digest("sha256:aaa");
        let c = cache(tmp.path(), &engine);

        let first = c.get_or_create(IMAGE, "sha256:aaa").unwrap();
        let second = c.get_or_create(IMAGE, "sha256:aaa").unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.runs.get(), 1);
    }

    #[test]
    fn digest_change_rebuilds_once() {
        let tmp = TempDir::new().unwrap();
        let engine = FakeEngine::with_digest("sha256:aaa");
        let c = cache(tmp.path(), &engine);

        c.get_or_create(IMAGE, "sha256:aaa").unwrap();
        *engine.payload.borrow_mut() = b"second build".to_vec();
        let disk = c.get_or_create(IMAGE, "sha256:bbb").unwrap();
        c.get_or_create(IMAGE, "sha256:bbb").unwrap();

        assert_eq!(engine.runs.get(), 2);
        assert_eq!(digest_of(&disk), "sha256:bbb");
        assert!(fs::read(&disk).unwrap().starts_with(b"second build"));
    }

    #[test]
    fn corrupt_metadata_triggers_rebuild() {
        let tmp = TempDir::new().unwrap();
        let engine = FakeEngine::with_digest("sha256:aaa");
        let c = cache(tmp.path(), &engine);
        let disk = c.disk_path_for(IMAGE);
        fs::write(&disk, b"leftover").unwrap();
        meta::testing::write_raw(&disk, b"\xff not json");

        let out = c.get_or_create(IMAGE, "sha256:aaa").unwrap();

        assert_eq!(engine.runs.get(), 1);
        assert_eq!(digest_of(&out), "sha256:aaa");
    }

    #[test]
    fn disk_without_metadata_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let engine = FakeEngine::with_digest("sha256:aaa");
        let c = cache(tmp.path(), &engine);
        let disk = c.disk_path_for(IMAGE);
        fs::write(&disk, b"half written by someone else").unwrap();

        c.get_or_create(IMAGE, "sha256:aaa").unwrap();

        assert_eq!(engine.runs.get(), 1);
        assert!(fs::read(&disk).unwrap().starts_with(b"bootable disk"));
    }

    #[test]
    fn failed_build_leaves_previous_disk_and_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let ok = FakeEngine::with_digest("sha256:aaa");
        let disk = cache(tmp.path(), &ok)
            .get_or_create(IMAGE, "sha256:aaa")
            .unwrap();
        let before = entries(tmp.path());

        let failing = FakeEngine {
            exit_code: 125,
            ..FakeEngine::with_digest("sha256:bbb")
        };
        let err = cache(tmp.path(), &failing)
            .get_or_create(IMAGE, "sha256:bbb")
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<VmrunError>(),
            Some(VmrunError::BuildFailed { .. })
        ));
        assert!(format!("{err:#}").contains("building disk for example.com/os:latest"));
        assert_eq!(entries(tmp.path()), before);
        assert_eq!(digest_of(&disk), "sha256:aaa");
    }

    #[test]
    fn final_name_only_ever_holds_complete_disks() {
        let tmp = TempDir::new().unwrap();
        let engine = FakeEngine::with_digest("sha256:aaa");
        let c = cache(tmp.path(), &engine);
        let disk = c.disk_path_for(IMAGE);
        *engine.watch.borrow_mut() = Some(disk.clone());

        c.get_or_create(IMAGE, "sha256:aaa").unwrap();
        let complete_v1 = fs::read(&disk).unwrap();
        *engine.payload.borrow_mut() = b"second build".to_vec();
        c.get_or_create(IMAGE, "sha256:bbb").unwrap();

        // While each build ran, the final name showed either nothing or the
        // previous complete disk.
        let watched = engine.watched.borrow();
        assert_eq!(watched.len(), 2);
        assert_eq!(watched[0], None);
        assert_eq!(watched[1].as_deref(), Some(complete_v1.as_slice()));
    }

    /// Installer that takes a while and counts how often it ran.
    struct SlowInstaller {
        builds: AtomicUsize,
    }

    impl DiskInstaller for SlowInstaller {
        fn install(&self, _image_name: &str, disk: &Path, _scratch_dir: &Path) -> Result<()> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            fs::write(disk, b"bootable disk")?;
            Ok(())
        }
    }

    #[test]
    fn concurrent_callers_share_one_build() {
        let tmp = TempDir::new().unwrap();
        let c = DiskCache::new(
            tmp.path(),
            SlowInstaller {
                builds: AtomicUsize::new(0),
            },
        )
        .with_disk_size(SIZE);

        let paths: Vec<PathBuf> = thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| s.spawn(|| c.get_or_create("a/b", "sha256:aaa").unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(c.installer.builds.load(Ordering::SeqCst), 1);
        assert!(paths.iter().all(|p| *p == c.disk_path_for("a/b")));
        assert_eq!(digest_of(&paths[0]), "sha256:aaa");
    }

    #[test]
    fn undeletable_stale_sidecar_does_not_block_rebuild() {
        let tmp = TempDir::new().unwrap();
        let engine = FakeEngine::with_digest("sha256:aaa");
        let c = cache(tmp.path(), &engine);
        let disk = c.disk_path_for(IMAGE);
        let check = tmp.path().join("xattr-check");
        fs::write(&check, b"").unwrap();
        if xattr::set(&check, meta::IMAGE_META_XATTR, b"{}").is_err() {
            // Without xattrs the record itself needs the sidecar path.
            return;
        }
        fs::remove_file(&check).unwrap();
        // A directory where the sidecar would be cannot be removed as a file.
        fs::create_dir(meta::sidecar_path(&disk)).unwrap();

        let out = c.get_or_create(IMAGE, "sha256:aaa").unwrap();

        assert_eq!(engine.runs.get(), 1);
        assert!(fs::read(&out).unwrap().starts_with(b"bootable disk"));
    }

    #[test]
    fn successful_build_cleans_up_scratch_files() {
        let tmp = TempDir::new().unwrap();
        let engine = FakeEngine::with_digest("sha256:aaa");
        let c = cache(tmp.path(), &engine);

        c.get_or_create(IMAGE, "sha256:aaa").unwrap();

        let names = entries(tmp.path());
        assert!(names.iter().all(|n| !n.starts_with(TEMP_DISK_PREFIX)));
        assert!(names.iter().all(|n| !n.starts_with("entrypoint")));
        assert!(names.contains(&cache_file_name(IMAGE)));
    }
}
