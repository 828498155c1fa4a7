//! Virtual device composition.
//!
//! Device lists are built here and rendered by each backend. Backends assign
//! slots by position, so the order of a list is part of its meaning and no
//! renderer may reorder it.

use std::path::{Path, PathBuf};

/// Vsock port the guest connects to once it has booted.
pub const READY_VSOCK_PORT: u32 = 1025;

/// Vsock port used to serve first-boot provisioning data.
pub const IGNITION_VSOCK_PORT: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pointing,
    Keyboard,
}

/// One paravirtualized device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtioDevice {
    /// Entropy source.
    Rng,
    /// Block device backed by a raw image.
    Blk { path: PathBuf },
    /// Serial console written to a log file.
    SerialLog { path: PathBuf },
    /// Serial console bound to the host's stdin/stdout/stderr.
    SerialStdio,
    /// Host socket bridged to a guest vsock port.
    Vsock {
        port: u32,
        socket_path: PathBuf,
        listen: bool,
    },
    Gpu { width: u32, height: u32 },
    Input(InputKind),
}

impl VirtioDevice {
    /// Short stable name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rng => "rng",
            Self::Blk { .. } => "blk",
            Self::SerialLog { .. } => "serial",
            Self::SerialStdio => "serial-stdio",
            Self::Vsock { .. } => "vsock",
            Self::Gpu { .. } => "gpu",
            Self::Input(InputKind::Pointing) => "input-pointing",
            Self::Input(InputKind::Keyboard) => "input-keyboard",
        }
    }
}

/// Devices every VM gets.
pub fn basic_devices() -> Vec<VirtioDevice> {
    vec![VirtioDevice::Rng]
}

/// Devices for a persistent machine: disk, console log, readiness channel.
pub fn default_devices(image: &Path, log: &Path, ready_socket: &Path) -> Vec<VirtioDevice> {
    let mut devices = basic_devices();
    devices.push(VirtioDevice::Blk {
        path: image.to_path_buf(),
    });
    devices.push(VirtioDevice::SerialLog {
        path: log.to_path_buf(),
    });
    devices.push(VirtioDevice::Vsock {
        port: READY_VSOCK_PORT,
        socket_path: ready_socket.to_path_buf(),
        listen: true,
    });
    devices
}

/// Display and input devices for interactive sessions.
pub fn debug_devices() -> Vec<VirtioDevice> {
    vec![
        VirtioDevice::Gpu {
            width: 800,
            height: 600,
        },
        VirtioDevice::Input(InputKind::Pointing),
        VirtioDevice::Input(InputKind::Keyboard),
    ]
}

pub fn ignition_device(socket: &Path) -> VirtioDevice {
    VirtioDevice::Vsock {
        port: IGNITION_VSOCK_PORT,
        socket_path: socket.to_path_buf(),
        listen: true,
    }
}

/// Devices for a transient run of `disk`: the basic set, the disk, then
/// either the GUI devices or a console on the caller's terminal.
pub fn transient_devices(disk: &Path, gui: bool) -> Vec<VirtioDevice> {
    let mut devices = basic_devices();
    devices.push(VirtioDevice::Blk {
        path: disk.to_path_buf(),
    });
    if gui {
        devices.extend(debug_devices());
    } else {
        devices.push(VirtioDevice::SerialStdio);
    }
    devices
}

/// Render for vfkit's `--device` flag.
pub fn vfkit_arg(device: &VirtioDevice) -> String {
    match device {
        VirtioDevice::Rng => "virtio-rng".to_string(),
        VirtioDevice::Blk { path } => format!("virtio-blk,path={}", path.display()),
        VirtioDevice::SerialLog { path } => {
            format!("virtio-serial,logFilePath={}", path.display())
        }
        VirtioDevice::SerialStdio => "virtio-serial,stdio".to_string(),
        VirtioDevice::Vsock {
            port,
            socket_path,
            listen,
        } => {
            let mode = if *listen { "listen" } else { "connect" };
            format!(
                "virtio-vsock,port={port},socketURL={},{mode}",
                socket_path.display()
            )
        }
        VirtioDevice::Gpu { width, height } => {
            format!("virtio-gpu,width={width},height={height}")
        }
        VirtioDevice::Input(InputKind::Pointing) => "virtio-input,pointing".to_string(),
        VirtioDevice::Input(InputKind::Keyboard) => "virtio-input,keyboard".to_string(),
    }
}

/// Render for a QEMU command line. `index` is the device's position in its
/// list and names any backing chardev/drive.
pub fn qemu_args(index: usize, device: &VirtioDevice) -> Vec<String> {
    let strs = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    match device {
        VirtioDevice::Rng => strs(&["-device", "virtio-rng-pci"]),
        VirtioDevice::Blk { path } => vec![
            "-drive".to_string(),
            format!("file={},if=virtio,format=raw", path.display()),
        ],
        VirtioDevice::SerialLog { path } => vec![
            "-chardev".to_string(),
            format!("file,id=dev{index},path={}", path.display()),
            "-serial".to_string(),
            format!("chardev:dev{index}"),
        ],
        VirtioDevice::SerialStdio => strs(&["-serial", "stdio"]),
        VirtioDevice::Vsock {
            port, socket_path, ..
        } => vec![
            "-chardev".to_string(),
            format!(
                "socket,path={},server=on,wait=off,id=dev{index}",
                socket_path.display()
            ),
            "-device".to_string(),
            "virtio-serial".to_string(),
            "-device".to_string(),
            format!("virtserialport,chardev=dev{index},name=port{port}"),
        ],
        VirtioDevice::Gpu { width, height } => vec![
            "-device".to_string(),
            format!("virtio-gpu-pci,xres={width},yres={height}"),
        ],
        VirtioDevice::Input(InputKind::Pointing) => strs(&["-device", "virtio-tablet-pci"]),
        VirtioDevice::Input(InputKind::Keyboard) => strs(&["-device", "virtio-keyboard-pci"]),
    }
}

/// Comma-separated kinds, in list order.
pub fn kinds(devices: &[VirtioDevice]) -> String {
    devices
        .iter()
        .map(VirtioDevice::kind)
        .collect::<Vec<_>>()
        .join(", ")
}
