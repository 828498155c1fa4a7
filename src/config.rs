//! Runtime configuration.
//!
//! Loaded from TOML. Every key is optional; a missing file means defaults.
//!
//! ```toml
//! disk_size_bytes = 21474836480
//! provider = "qemu"
//! helper_dirs = ["/usr/libexec/podman"]
//!
//! [engine]
//! binary = "podman"
//! connection = "podman-machine-default-root"
//!
//! [transient]
//! cpus = 4
//! memory_mib = 4096
//! gui = false
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::provider::VmType;

/// Directory name used under the user's data and config directories.
pub const APP_DIR_NAME: &str = "bootc-vmrun";

/// Config filename looked up under `<config_dir>/bootc-vmrun/`.
pub const CONFIG_FILENAME: &str = "config.toml";

/// Virtual capacity of generated disks.
pub const DEFAULT_DISK_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmrunConfig {
    /// Root for cached disks. Defaults to `<data_dir>/bootc-vmrun`.
    pub data_dir: Option<PathBuf>,
    /// Root for persisted machine records. Defaults to
    /// `<config_dir>/bootc-vmrun/machines`.
    pub machine_dir: Option<PathBuf>,
    pub disk_size_bytes: u64,
    /// Force a backend instead of picking one for the host.
    pub provider: Option<VmType>,
    /// Searched before `PATH` when locating hypervisor binaries.
    pub helper_dirs: Vec<PathBuf>,
    pub engine: EngineConfig,
    pub transient: TransientConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub binary: String,
    /// Forwarded as `--connection=<name>` to every engine invocation.
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransientConfig {
    pub cpus: u16,
    pub memory_mib: u64,
    pub gui: bool,
}

impl Default for VmrunConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            machine_dir: None,
            disk_size_bytes: DEFAULT_DISK_SIZE_BYTES,
            provider: None,
            helper_dirs: Vec::new(),
            engine: EngineConfig::default(),
            transient: TransientConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "podman".to_string(),
            connection: None,
        }
    }
}

impl Default for TransientConfig {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mib: 2048,
            gui: true,
        }
    }
}

impl VmrunConfig {
    /// Load from an explicit path, or from the default location if it exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config '{}'", path.display()))
    }

    /// Directory holding cached disk images.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|d| d.join(APP_DIR_NAME))
                .context("cannot determine user data directory; set data_dir in config"),
        }
    }

    /// Directory holding machine records for one backend.
    pub fn machine_dir_for(&self, vm_type: VmType) -> Result<PathBuf> {
        let root = match &self.machine_dir {
            Some(dir) => dir.clone(),
            None => dirs::config_dir()
                .map(|d| d.join(APP_DIR_NAME).join("machines"))
                .context("cannot determine user config directory; set machine_dir in config")?,
        };
        Ok(root.join(vm_type.as_str()))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join(CONFIG_FILENAME))
}
