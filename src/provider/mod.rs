//! Virtualization providers.
//!
//! Every backend implements [`VirtProvider`]. One is picked at startup for
//! the host ([`for_host`]) and passed explicitly to whatever needs it.
//!
//! - `applehv` - vfkit on macOS's Virtualization.framework
//! - `qemu` - QEMU with per-architecture flags chosen at compile time

pub mod qemu;
pub mod vfkit;

use anyhow::Result;
use serde::Deserialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::VmrunConfig;
use crate::error::VmrunError;
use crate::machine::{
    InitOptions, ListOptions, ListResponse, MachineRecord, MachineState, MachineStore, VmSpec,
};

pub use qemu::QemuProvider;
pub use vfkit::AppleHvProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum VmType {
    #[serde(rename = "qemu")]
    Qemu,
    #[serde(rename = "applehv")]
    AppleHv,
}

impl VmType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::AppleHv => "applehv",
        }
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities every virtualization backend offers.
pub trait VirtProvider {
    /// Name of the first persisted machine that is Running or Starting.
    ///
    /// At most one persistent machine per backend may be active. Transient
    /// runs are not counted.
    fn check_exclusive_active_vm(&self) -> Result<Option<String>>;

    /// Whether `name` refers to a loadable machine record.
    fn is_valid_vm_name(&self, name: &str) -> Result<bool>;

    /// Every persisted machine with its probed state.
    fn list(&self, opts: &ListOptions) -> Result<Vec<ListResponse>>;

    fn load_vm_by_name(&self, name: &str) -> Result<MachineRecord>;

    /// Create and persist a machine record.
    fn new_machine(&self, opts: &InitOptions) -> Result<MachineRecord>;

    /// Boot `spec` with the caller's terminal attached and wait for it to
    /// exit. The VM's own exit status is logged, not returned.
    fn spawn_transient(&self, spec: &VmSpec) -> Result<()>;

    fn remove_and_clean_machines(&self) -> Result<()>;

    fn vm_type(&self) -> VmType;
}

/// Probe every record in `store`.
///
/// An endpoint that refuses the connection (or whose socket file is gone)
/// belongs to a machine that is not running. Any other probe failure aborts
/// the listing.
pub(crate) fn list_with_probe<F>(
    store: &MachineStore,
    vm_type: VmType,
    mut probe: F,
) -> Result<Vec<ListResponse>>
where
    F: FnMut(&MachineRecord) -> io::Result<MachineState>,
{
    let mut response = vec![];
    for record in store.load_all()? {
        let state = match probe(&record) {
            Ok(state) => state,
            Err(e) if endpoint_absent(&e) => MachineState::Stopped,
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!(
                    "probing state of machine '{}' at {}",
                    record.name,
                    record.endpoint.to_uri()
                )))
            }
        };
        response.push(ListResponse {
            name: record.name,
            vm_type: vm_type.to_string(),
            state,
            cpus: record.cpus,
            memory_bytes: record.memory_mib.saturating_mul(1024 * 1024),
            disk_size_bytes: record.disk_size_gib.saturating_mul(1024 * 1024 * 1024),
            created_unix: record.created_unix,
            last_up_unix: record.last_up_unix,
            image_stream: record.image_stream,
        });
    }
    Ok(response)
}

/// First Running or Starting machine in listing order.
pub(crate) fn first_active(machines: &[ListResponse]) -> Option<String> {
    machines
        .iter()
        .find(|m| m.state.is_active())
        .map(|m| m.name.clone())
}

/// Whether `name` loads from `store`. Unknown or malformed names are simply
/// not valid; unreadable records are errors.
pub(crate) fn is_loadable(store: &MachineStore, name: &str) -> Result<bool> {
    match store.load(name) {
        Ok(_) => Ok(true),
        Err(e) => match e.downcast_ref::<VmrunError>() {
            Some(VmrunError::MachineNotFound(_) | VmrunError::InvalidMachineName(_)) => Ok(false),
            _ => Err(e),
        },
    }
}

fn endpoint_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
    )
}

/// Locate a hypervisor binary in the configured helper dirs, then `PATH`.
pub fn find_helper_binary(name: &str, helper_dirs: &[PathBuf]) -> Result<PathBuf> {
    for dir in helper_dirs {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    which::which(name).map_err(|_| {
        VmrunError::ProviderUnavailable(format!(
            "could not find '{name}' in helper directories {helper_dirs:?} or PATH"
        ))
        .into()
    })
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// The backend this host should use.
///
/// An explicit `provider` in config wins. Otherwise macOS uses applehv and
/// everything else QEMU. The backend's binary must be present.
pub fn for_host(config: &VmrunConfig) -> Result<Box<dyn VirtProvider>> {
    let vm_type = match config.provider {
        Some(vm_type) => vm_type,
        None if cfg!(target_os = "macos") => VmType::AppleHv,
        None if cfg!(any(target_os = "linux", target_os = "freebsd")) => VmType::Qemu,
        None => {
            return Err(VmrunError::ProviderUnavailable(format!(
                "no virtualization backend for {}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ))
            .into())
        }
    };

    let store = MachineStore::new(config.machine_dir_for(vm_type)?);
    let provider: Box<dyn VirtProvider> = match vm_type {
        VmType::AppleHv => Box::new(AppleHvProvider::new(
            find_helper_binary(vfkit::VFKIT_BINARY, &config.helper_dirs)?,
            store,
        )),
        VmType::Qemu => Box::new(QemuProvider::new(
            find_helper_binary(qemu::arch::QEMU_COMMAND, &config.helper_dirs)?,
            store,
        )),
    };
    Ok(provider)
}
