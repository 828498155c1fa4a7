//! Boot bootable container images as throwaway virtual machines.
//!
//! A container image is installed onto a raw disk by running `bootc install`
//! inside the image itself, the disk is cached against the image digest, and a
//! private copy is booted on whichever hypervisor the host provides.
//!
//! - **Disk cache** - digest-validated raw disks, atomically published
//! - **Container engine** - digest lookup, pull, privileged install run
//! - **Devices** - ordered virtio device lists and their renderings
//! - **Providers** - one backend per hypervisor behind a single trait
//!
//! # Architecture
//!
//! ```text
//! run::TransientVmRunner
//!     │
//!     ├── engine::resolve_digest ──── ContainerEngine (podman)
//!     ├── disk::DiskCache ─────────── DiskInstaller (bootc in a container)
//!     │       └── disk::meta          xattr or sidecar {imageDigest}
//!     └── provider::VirtProvider
//!             ├── applehv (vfkit) ─── devices::vfkit_arg
//!             └── qemu ────────────── devices::qemu_args, qemu::arch
//! ```
//!
//! The provider is constructed once ([`provider::for_host`]) and passed in, so
//! tests substitute their own.

pub mod config;
pub mod devices;
pub mod disk;
pub mod engine;
pub mod error;
pub mod logging;
pub mod machine;
pub mod process;
pub mod provider;
pub mod run;

pub use error::VmrunError;
