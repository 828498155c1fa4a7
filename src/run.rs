//! Boot a container image as a throwaway VM.
//!
//! Resolve the image digest, get (or build) the cached disk, copy it, and
//! boot the copy. The cached disk is never handed to a hypervisor.

use anyhow::{Context, Result};
use std::path::Path;
use tempfile::TempPath;
use tracing::{debug, info};

use crate::disk::{DiskCache, DiskInstaller};
use crate::engine::{resolve_digest, ContainerEngine};
use crate::machine::VmSpec;
use crate::process::Cmd;
use crate::provider::VirtProvider;

/// Resources and presentation for one run.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub cpus: u16,
    pub memory_mib: u64,
    pub gui: bool,
    pub debug: bool,
}

pub struct TransientVmRunner<'a, I> {
    engine: &'a dyn ContainerEngine,
    cache: &'a DiskCache<I>,
    provider: &'a dyn VirtProvider,
}

impl<'a, I: DiskInstaller> TransientVmRunner<'a, I> {
    pub fn new(
        engine: &'a dyn ContainerEngine,
        cache: &'a DiskCache<I>,
        provider: &'a dyn VirtProvider,
    ) -> Self {
        Self {
            engine,
            cache,
            provider,
        }
    }

    /// Run `image` until the VM exits.
    ///
    /// Errors before launch are returned. Once the hypervisor has started, its
    /// exit status is the provider's to log, not ours to return.
    pub fn run(&self, image: &str, opts: &RunOptions) -> Result<()> {
        let digest = resolve_digest(self.engine, image)?;
        let disk = self.cache.get_or_create(image, &digest)?;
        println!("{}", disk.display());

        let clone = clone_disk(&disk)?;
        info!(
            "Booting {image} on {} with {} from {}",
            self.provider.vm_type(),
            clone.display(),
            disk.display()
        );
        self.provider.spawn_transient(&VmSpec {
            cpus: opts.cpus,
            memory_mib: opts.memory_mib,
            disk: clone.to_path_buf(),
            gui: opts.gui,
            debug: opts.debug,
        })
    }
}

/// Private copy of `disk` in the same directory, deleted when dropped.
///
/// Uses a copy-on-write clone where the filesystem supports one.
pub fn clone_disk(disk: &Path) -> Result<TempPath> {
    let dir = disk
        .parent()
        .with_context(|| format!("{} has no parent directory", disk.display()))?;
    let clone = tempfile::Builder::new()
        .prefix(".vmrun-clone-")
        .tempfile_in(dir)
        .with_context(|| format!("creating clone in {}", dir.display()))?
        .into_temp_path();

    let cmd = Cmd::new("cp")
        .arg(if cfg!(target_os = "macos") {
            "-c"
        } else {
            "--reflink=auto"
        })
        .arg_path(disk)
        .arg_path(&clone)
        .error_msg(format!("Failed to clone {}", disk.display()));
    debug!("Executing {}", cmd.display());
    cmd.run()?;
    Ok(clone)
}
