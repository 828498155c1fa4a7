//! QEMU backend.
//!
//! Persistent machines expose QMP on a Unix socket, which is how their state
//! is probed. Transient runs get no monitor at all.

pub mod arch;

use anyhow::{Context, Result};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::{first_active, is_loadable, list_with_probe, VirtProvider, VmType};
use crate::devices::{self, qemu_args, VirtioDevice};
use crate::error::VmrunError;
use crate::machine::{
    now_unix, validate_name, ControlEndpoint, InitOptions, ListOptions, ListResponse,
    MachineRecord, MachineState, MachineStore, VmSpec,
};
use crate::process::Cmd;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Builder for transient QEMU command lines.
#[derive(Debug, Clone)]
pub struct QemuCommand {
    binary: PathBuf,
    cpus: u16,
    memory_mib: u64,
    firmware: Option<PathBuf>,
    devices: Vec<VirtioDevice>,
    headless: bool,
    debug: bool,
}

impl QemuCommand {
    pub fn new(binary: impl Into<PathBuf>, cpus: u16, memory_mib: u64) -> Self {
        Self {
            binary: binary.into(),
            cpus,
            memory_mib,
            firmware: None,
            devices: Vec::new(),
            headless: false,
            debug: false,
        }
    }

    pub fn firmware(mut self, path: Option<PathBuf>) -> Self {
        self.firmware = path;
        self
    }

    pub fn devices(mut self, devices: Vec<VirtioDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = arch::arch_options();
        args.extend(["-smp".to_string(), self.cpus.to_string()]);
        args.extend(["-m".to_string(), format!("{}M", self.memory_mib)]);

        if let Some(fw) = &self.firmware {
            args.push("-drive".to_string());
            args.push(format!("if=pflash,format=raw,readonly=on,file={}", fw.display()));
        }

        // Device identity follows list position.
        for (index, device) in self.devices.iter().enumerate() {
            args.extend(qemu_args(index, device));
        }

        if self.headless {
            args.extend(["-display".to_string(), "none".to_string()]);
        }

        // No monitor and no QMP: nothing can administer a transient run.
        args.extend(["-monitor".to_string(), "none".to_string()]);

        if self.debug {
            args.extend(["-d".to_string(), "guest_errors".to_string()]);
        }
        args
    }

    pub fn build(&self) -> Cmd {
        Cmd::new(&self.binary).args(self.args())
    }
}

/// Translate `vendor=XXXX,product=YYYY` or `bus=N,devnum=M` into `usb-host`
/// properties.
pub fn usb_host_props(device: &str) -> Result<String> {
    let mut vendor = None;
    let mut product = None;
    let mut bus = None;
    let mut devnum = None;
    for pair in device.split(',') {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("USB device '{device}': expected key=value pairs"))?;
        match key {
            "vendor" => vendor = Some(value),
            "product" => product = Some(value),
            "bus" => bus = Some(value),
            "devnum" => devnum = Some(value),
            other => anyhow::bail!("USB device '{device}': unknown key '{other}'"),
        }
    }
    match (vendor, product, bus, devnum) {
        (Some(v), Some(p), None, None) => Ok(format!("vendorid=0x{v},productid=0x{p}")),
        (None, None, Some(b), Some(d)) => Ok(format!("hostbus={b},hostaddr={d}")),
        _ => anyhow::bail!(
            "USB device '{device}': use either vendor=<id>,product=<id> or bus=<n>,devnum=<n>"
        ),
    }
}

pub struct QemuProvider {
    binary: PathBuf,
    store: MachineStore,
}

impl QemuProvider {
    pub fn new(binary: PathBuf, store: MachineStore) -> Self {
        Self { binary, store }
    }
}

impl VirtProvider for QemuProvider {
    fn check_exclusive_active_vm(&self) -> Result<Option<String>> {
        Ok(first_active(&self.list(&ListOptions::default())?))
    }

    fn is_valid_vm_name(&self, name: &str) -> Result<bool> {
        is_loadable(&self.store, name)
    }

    fn list(&self, _opts: &ListOptions) -> Result<Vec<ListResponse>> {
        list_with_probe(&self.store, VmType::Qemu, |record| match &record.endpoint {
            ControlEndpoint::Unix { path } => qmp_state(path),
            ControlEndpoint::Tcp { host, port } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("QMP is not served over tcp://{host}:{port}"),
            )),
        })
    }

    fn load_vm_by_name(&self, name: &str) -> Result<MachineRecord> {
        self.store.load(name)
    }

    fn new_machine(&self, opts: &InitOptions) -> Result<MachineRecord> {
        validate_name(&opts.name)?;
        if self.store.exists(&opts.name)? {
            return Err(VmrunError::MachineExists(opts.name.clone()).into());
        }
        let usb = opts
            .usb_devices
            .iter()
            .map(|d| usb_host_props(d))
            .collect::<Result<Vec<_>>>()?;

        let dir = self.store.dir();
        let name = &opts.name;
        let disk_path = opts
            .image_path
            .clone()
            .unwrap_or_else(|| dir.join(format!("{name}.raw")));
        let devices = devices::default_devices(
            &disk_path,
            &dir.join(format!("{name}.log")),
            &dir.join(format!("{name}-ready.sock")),
        );
        let mut rendered: Vec<String> = devices
            .iter()
            .enumerate()
            .map(|(i, d)| qemu_args(i, d).join(" "))
            .collect();
        if !usb.is_empty() {
            rendered.push("-device qemu-xhci".to_string());
            rendered.extend(usb.iter().map(|u| format!("-device usb-host,{u}")));
        }

        let record = MachineRecord {
            name: name.clone(),
            cpus: opts.cpus,
            memory_mib: opts.memory_mib,
            disk_size_gib: opts.disk_size_gib,
            disk_path,
            created_unix: now_unix(),
            last_up_unix: None,
            endpoint: ControlEndpoint::Unix {
                path: dir.join(format!("{name}-qmp.sock")),
            },
            devices: rendered,
            image_stream: opts.image_stream.clone(),
        };
        self.store.create(&record)?;
        info!("Created qemu machine {name}");
        Ok(record)
    }

    fn spawn_transient(&self, spec: &VmSpec) -> Result<()> {
        arch::prepare()?;
        let devices = devices::transient_devices(&spec.disk, spec.gui);
        debug!("Transient devices: {}", devices::kinds(&devices));
        let cmd = QemuCommand::new(&self.binary, spec.cpus, spec.memory_mib)
            .firmware(arch::firmware())
            .devices(devices)
            .headless(!spec.gui)
            .debug(spec.debug)
            .build()
            .error_msg("Failed to launch qemu");
        debug!("Spawning qemu: {}", cmd.display());
        let status = cmd.run_interactive()?;
        if !status.success() {
            info!("qemu exited with error: {status}");
        }
        Ok(())
    }

    fn remove_and_clean_machines(&self) -> Result<()> {
        if let Some(active) = self.check_exclusive_active_vm()? {
            return Err(VmrunError::MachineActive(active).into());
        }

        for record in self.store.load_all()? {
            let mut files = vec![record.disk_path.clone()];
            if let ControlEndpoint::Unix { path } = &record.endpoint {
                files.push(path.clone());
            }
            files.extend(arch::arch_removal_files(&record));
            for file in &files {
                remove_if_present(file)?;
            }
            self.store.remove(&record.name)?;
            info!("Removed qemu machine {}", record.name);
        }
        Ok(())
    }

    fn vm_type(&self) -> VmType {
        VmType::Qemu
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Ask a QMP socket for the VM run state.
pub fn qmp_state(socket: &Path) -> io::Result<MachineState> {
    let stream = UnixStream::connect(socket)?;
    stream.set_read_timeout(Some(PROBE_TIMEOUT))?;
    stream.set_write_timeout(Some(PROBE_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let greeting = read_message(&mut reader)?;
    if greeting.get("QMP").is_none() {
        return Err(invalid_data("missing QMP greeting"));
    }
    execute(&mut writer, &mut reader, "qmp_capabilities")?;
    let status = execute(&mut writer, &mut reader, "query-status")?;
    let state = status
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or_else(|| invalid_data("query-status returned no status"))?;
    Ok(map_run_state(state))
}

fn map_run_state(state: &str) -> MachineState {
    match state {
        "running" => MachineState::Running,
        "prelaunch" | "inmigrate" | "restore-vm" => MachineState::Starting,
        _ => MachineState::Stopped,
    }
}

/// Send one command and wait for its reply, skipping async events.
fn execute(
    writer: &mut UnixStream,
    reader: &mut BufReader<UnixStream>,
    command: &str,
) -> io::Result<serde_json::Value> {
    let msg = serde_json::json!({ "execute": command });
    writer.write_all(msg.to_string().as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    loop {
        let mut reply = read_message(reader)?;
        if let Some(ret) = reply.get_mut("return") {
            return Ok(ret.take());
        }
        if let Some(err) = reply.get("error") {
            return Err(io::Error::other(format!(
                "{command}: {}",
                err.get("desc").unwrap_or(err)
            )));
        }
        if reply.get("event").is_none() {
            return Err(invalid_data(format!("{command}: unexpected reply {reply}")));
        }
    }
}

fn read_message(reader: &mut BufReader<UnixStream>) -> io::Result<serde_json::Value> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "QMP peer closed the connection",
        ));
    }
    serde_json::from_str(&line).map_err(|e| invalid_data(e.to_string()))
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
