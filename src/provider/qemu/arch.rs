//! Per-target QEMU binary and machine flags.
//!
//! Chosen at compile time. Each target supplies the emulator command, the
//! machine/acceleration/CPU flags, and where to look for UEFI firmware when
//! the machine type does not bundle it.

use anyhow::Result;
use std::path::PathBuf;

use crate::error::VmrunError;
use crate::machine::MachineRecord;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod target {
    pub const QEMU_COMMAND: &str = "qemu-system-x86_64";
    pub const OPTIONS: &[&str] = &["-accel", "kvm", "-cpu", "host"];
    pub const FIRMWARE: &[&str] = &[];
}

#[cfg(all(target_arch = "x86_64", target_os = "macos"))]
mod target {
    pub const QEMU_COMMAND: &str = "qemu-system-x86_64";
    pub const OPTIONS: &[&str] = &["-machine", "q35,accel=hvf:tcg", "-cpu", "host"];
    pub const FIRMWARE: &[&str] = &[];
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
mod target {
    pub const QEMU_COMMAND: &str = "qemu-system-aarch64";
    pub const OPTIONS: &[&str] = &["-machine", "virt", "-accel", "kvm", "-cpu", "host"];
    pub const FIRMWARE: &[&str] = &[
        "/usr/share/edk2/aarch64/QEMU_EFI.fd",
        "/usr/share/AAVMF/AAVMF_CODE.fd",
        "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
        "/usr/share/edk2-armvirt/aarch64/QEMU_EFI.fd",
    ];
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
mod target {
    pub const QEMU_COMMAND: &str = "qemu-system-aarch64";
    // Repeated -accel options are tried in order.
    pub const OPTIONS: &[&str] = &[
        "-machine", "virt", "-accel", "hvf", "-accel", "tcg", "-cpu", "host",
    ];
    pub const FIRMWARE: &[&str] = &[
        "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
        "/usr/local/share/qemu/edk2-aarch64-code.fd",
    ];
}

#[cfg(all(target_arch = "aarch64", not(any(target_os = "linux", target_os = "macos"))))]
mod target {
    pub const QEMU_COMMAND: &str = "qemu-system-aarch64";
    pub const OPTIONS: &[&str] = &["-machine", "virt", "-accel", "tcg", "-cpu", "max"];
    pub const FIRMWARE: &[&str] = &[
        "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
        "/usr/local/share/qemu/edk2-aarch64-code.fd",
    ];
}

#[cfg(not(any(
    all(target_arch = "x86_64", any(target_os = "linux", target_os = "macos")),
    target_arch = "aarch64",
)))]
mod target {
    pub const QEMU_COMMAND: &str = "qemu-system-x86_64";
    pub const OPTIONS: &[&str] = &["-machine", "q35", "-accel", "tcg"];
    pub const FIRMWARE: &[&str] = &[];
}

pub const QEMU_COMMAND: &str = target::QEMU_COMMAND;

/// Machine, acceleration and CPU flags for this target.
pub fn arch_options() -> Vec<String> {
    target::OPTIONS.iter().map(|s| s.to_string()).collect()
}

/// UEFI firmware to load as read-only pflash, if this target needs one.
pub fn firmware() -> Option<PathBuf> {
    target::FIRMWARE
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Pre-flight check before launching QEMU.
pub fn prepare() -> Result<()> {
    if !target::FIRMWARE.is_empty() && firmware().is_none() {
        return Err(VmrunError::ProviderUnavailable(format!(
            "no UEFI firmware for {QEMU_COMMAND}; looked in {:?}",
            target::FIRMWARE
        ))
        .into());
    }
    Ok(())
}

/// Extra files to delete along with a machine.
pub fn arch_removal_files(_record: &MachineRecord) -> Vec<PathBuf> {
    Vec::new()
}
