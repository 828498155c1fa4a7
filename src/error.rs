//! Error categories callers need to tell apart.
//!
//! Everything else travels as `anyhow::Error` with context attached at the
//! failing step. These variants are wrapped into `anyhow::Error` as well and
//! recovered with `downcast_ref::<VmrunError>()`.

use std::process::ExitStatus;

use thiserror::Error;

use crate::provider::VmType;

#[derive(Debug, Error)]
pub enum VmrunError {
    /// Inspect/pull of the source image did not succeed.
    #[error("failed to resolve image '{image}': {reason}")]
    ImageResolution { image: String, reason: String },

    /// The disk-generation container exited unsuccessfully.
    #[error("failed to run container to generate disk for '{image}': {status}")]
    BuildFailed { image: String, status: ExitStatus },

    /// No virtualization backend can be used on this host.
    #[error("no usable virtualization provider: {0}")]
    ProviderUnavailable(String),

    /// The backend deliberately does not provide this capability yet.
    #[error("{operation} is not implemented for {vm_type} machines")]
    NotImplemented {
        operation: &'static str,
        vm_type: VmType,
    },

    #[error("machine '{0}' does not exist")]
    MachineNotFound(String),

    #[error("machine '{0}' already exists")]
    MachineExists(String),

    #[error("invalid machine name '{0}': must be a non-empty filename segment")]
    InvalidMachineName(String),

    #[error("machine '{0}' is currently active")]
    MachineActive(String),
}

impl VmrunError {
    /// Whether `err` carries the unimplemented-capability sentinel.
    pub fn is_not_implemented(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<VmrunError>(),
            Some(VmrunError::NotImplemented { .. })
        )
    }
}
