//! Installs a bootable container image onto a raw disk file.
//!
//! The work happens inside the image itself: a privileged container gets
//! the disk file and a small wrapper script bind-mounted in, the script
//! attaches the file as a loop device and runs `bootc install to-disk`.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::info;

use crate::engine::{BindMount, ContainerEngine, ContainerRun};
use crate::error::VmrunError;

/// Where the disk file appears inside the installer container.
pub const DISK_IN_CONTAINER: &str = "/disk";

/// Where the wrapper script appears inside the installer container.
pub const ENTRYPOINT_IN_CONTAINER: &str = "/entrypoint";

/// SELinux label letting the container touch loop devices on the host.
const UNCONFINED_LABEL: &str = "label=type:unconfined_t";

/// Wrapper run inside the source image.
///
/// `$1` is the disk file. The loop device is detached whether or not the
/// installer succeeds and the installer's exit code becomes the script's.
pub const LOOP_WRAPPER_ENTRYPOINT: &str = r#"#!/bin/bash
set -euo pipefail
disk=$1
shift
set -x
dev=$(losetup --show -P -f "$disk")
rc=0
set +e
bootc install to-disk --karg console=hvc0 --karg console=ttyS0,114800n8 --karg console=tty0 \
  --skip-fetch-check --generic-image --via-loopback "$disk"
rc=$?
losetup -d "$dev"
exit $rc
"#;

/// Fills a pre-sized disk file with an installed OS.
pub trait DiskInstaller {
    /// Install `image_name` onto `disk`. `scratch_dir` may hold temporary
    /// files for the duration of the call.
    fn install(&self, image_name: &str, disk: &Path, scratch_dir: &Path) -> Result<()>;
}

/// Installer that runs `bootc install` in a container via the engine.
pub struct ContainerInstaller<'a> {
    engine: &'a dyn ContainerEngine,
    bootc_log_level: Option<String>,
}

impl<'a> ContainerInstaller<'a> {
    pub fn new(engine: &'a dyn ContainerEngine) -> Self {
        Self {
            engine,
            bootc_log_level: None,
        }
    }

    /// Forward `RUST_LOG=<level>` to bootc inside the container.
    pub fn with_log_level(mut self, level: Option<String>) -> Self {
        self.bootc_log_level = level.filter(|l| !l.is_empty());
        self
    }

    fn container_run(&self, image_name: &str, disk: &Path, entrypoint: &Path) -> ContainerRun {
        let env = self
            .bootc_log_level
            .iter()
            .map(|level| ("RUST_LOG".to_string(), level.clone()))
            .collect();

        ContainerRun {
            image: image_name.to_string(),
            privileged: true,
            pid_host: true,
            security_opts: vec![UNCONFINED_LABEL.to_string()],
            env,
            mounts: vec![
                BindMount {
                    host: disk.to_path_buf(),
                    container: DISK_IN_CONTAINER.to_string(),
                },
                BindMount {
                    host: entrypoint.to_path_buf(),
                    container: ENTRYPOINT_IN_CONTAINER.to_string(),
                },
            ],
            command: vec![
                "/bin/bash".to_string(),
                ENTRYPOINT_IN_CONTAINER.to_string(),
                DISK_IN_CONTAINER.to_string(),
            ],
        }
    }
}

impl DiskInstaller for ContainerInstaller<'_> {
    fn install(&self, image_name: &str, disk: &Path, scratch_dir: &Path) -> Result<()> {
        // Removed on drop, on every return path.
        let mut entrypoint = tempfile::Builder::new()
            .prefix("entrypoint")
            .tempfile_in(scratch_dir)
            .with_context(|| format!("creating entrypoint in {}", scratch_dir.display()))?;
        entrypoint
            .write_all(LOOP_WRAPPER_ENTRYPOINT.as_bytes())
            .context("writing entrypoint")?;
        entrypoint.flush()?;
        fs::set_permissions(entrypoint.path(), fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", entrypoint.path().display()))?;

        info!("Generating disk image");
        let spec = self.container_run(image_name, disk, entrypoint.path());
        let status = self.engine.run(&spec)?;
        if !status.success() {
            return Err(VmrunError::BuildFailed {
                image: image_name.to_string(),
                status,
            }
            .into());
        }
        Ok(())
    }
}
