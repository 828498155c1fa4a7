//! Apple Virtualization.framework backend, driven through `vfkit`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::{first_active, is_loadable, list_with_probe, VirtProvider, VmType};
use crate::devices::{self, vfkit_arg};
use crate::error::VmrunError;
use crate::machine::{
    now_unix, validate_name, ControlEndpoint, InitOptions, ListOptions, ListResponse,
    MachineRecord, MachineState, MachineStore, VmSpec,
};
use crate::process::Cmd;

pub const VFKIT_BINARY: &str = "vfkit";

/// Disables vfkit's HTTP control API.
const RESTFUL_URI_NONE: &str = "--restful-uri=none://";

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct AppleHvProvider {
    binary: PathBuf,
    store: MachineStore,
}

impl AppleHvProvider {
    pub fn new(binary: PathBuf, store: MachineStore) -> Self {
        Self { binary, store }
    }
}

impl VirtProvider for AppleHvProvider {
    fn check_exclusive_active_vm(&self) -> Result<Option<String>> {
        Ok(first_active(&self.list(&ListOptions::default())?))
    }

    fn is_valid_vm_name(&self, name: &str) -> Result<bool> {
        is_loadable(&self.store, name)
    }

    fn list(&self, _opts: &ListOptions) -> Result<Vec<ListResponse>> {
        list_with_probe(&self.store, VmType::AppleHv, |record| match &record.endpoint {
            ControlEndpoint::Tcp { host, port } => rest_state(host, *port),
            ControlEndpoint::Unix { path } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("vfkit cannot be probed over unix socket {}", path.display()),
            )),
        })
    }

    fn load_vm_by_name(&self, name: &str) -> Result<MachineRecord> {
        self.store.load(name)
    }

    fn new_machine(&self, opts: &InitOptions) -> Result<MachineRecord> {
        if !opts.usb_devices.is_empty() {
            bail!("USB host passthrough is not supported for applehv machines");
        }
        validate_name(&opts.name)?;
        if self.store.exists(&opts.name)? {
            return Err(VmrunError::MachineExists(opts.name.clone()).into());
        }

        let dir = self.store.dir();
        let name = &opts.name;
        let disk_path = opts
            .image_path
            .clone()
            .unwrap_or_else(|| dir.join(format!("{name}.raw")));
        let mut devices = devices::default_devices(
            &disk_path,
            &dir.join(format!("{name}.log")),
            &dir.join(format!("{name}-ready.sock")),
        );
        devices.push(devices::ignition_device(
            &dir.join(format!("{name}-ignition.sock")),
        ));

        let record = MachineRecord {
            name: name.clone(),
            cpus: opts.cpus,
            memory_mib: opts.memory_mib,
            disk_size_gib: opts.disk_size_gib,
            disk_path,
            created_unix: now_unix(),
            last_up_unix: None,
            endpoint: ControlEndpoint::Tcp {
                host: "localhost".to_string(),
                port: free_local_port()?,
            },
            devices: devices.iter().map(vfkit_arg).collect(),
            image_stream: opts.image_stream.clone(),
        };
        self.store.create(&record)?;
        info!("Created applehv machine {name}");
        Ok(record)
    }

    fn spawn_transient(&self, spec: &VmSpec) -> Result<()> {
        let tmp = tempfile::Builder::new()
            .prefix("podman-machine-applehv-")
            .tempdir()
            .context("creating vfkit scratch directory")?;
        let efi_dir = tmp.path().join("efi");
        std::fs::create_dir_all(&efi_dir)
            .with_context(|| format!("creating {}", efi_dir.display()))?;

        let cmd = Cmd::new(&self.binary)
            .args(transient_args(spec, &efi_dir.join("applehv-transient")))
            .error_msg("Failed to launch vfkit");
        debug!("Spawning vfkit: {}", cmd.display());
        let status = cmd.run_interactive()?;
        if !status.success() {
            info!("vfkit exited with error: {status}");
        }
        Ok(())
    }

    fn remove_and_clean_machines(&self) -> Result<()> {
        Err(VmrunError::NotImplemented {
            operation: "remove_and_clean_machines",
            vm_type: VmType::AppleHv,
        }
        .into())
    }

    fn vm_type(&self) -> VmType {
        VmType::AppleHv
    }
}

/// vfkit arguments for a transient run of `spec`.
pub fn transient_args(spec: &VmSpec, efi_store: &Path) -> Vec<String> {
    let mut args = vec![
        "--cpus".to_string(),
        spec.cpus.to_string(),
        "--memory".to_string(),
        spec.memory_mib.to_string(),
        "--bootloader".to_string(),
        format!("efi,variable-store={},create", efi_store.display()),
    ];
    let devices = devices::transient_devices(&spec.disk, spec.gui);
    debug!("Transient devices: {}", devices::kinds(&devices));
    for device in &devices {
        args.push("--device".to_string());
        args.push(vfkit_arg(device));
    }
    args.push(RESTFUL_URI_NONE.to_string());
    if spec.gui {
        args.push("--gui".to_string());
    }
    if spec.debug {
        args.push("--log-level".to_string());
        args.push("debug".to_string());
    }
    args
}

#[derive(Deserialize)]
struct VmStateResponse {
    state: String,
}

/// Ask a vfkit control API for the VM state.
///
/// Errors keep their `io::ErrorKind` so a refused connection can be told
/// apart from a broken endpoint.
pub fn rest_state(host: &str, port: u16) -> io::Result<MachineState> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(PROBE_TIMEOUT)
        .timeout(PROBE_TIMEOUT)
        .no_proxy()
        .build()
        .map_err(io::Error::other)?;

    let parsed: VmStateResponse = client
        .get(format!("http://{host}:{port}/vm/state"))
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.json())
        .map_err(into_io_error)?;
    Ok(map_vfkit_state(&parsed.state))
}

fn map_vfkit_state(state: &str) -> MachineState {
    match state {
        "VirtualMachineStateRunning" => MachineState::Running,
        "VirtualMachineStateStarting" => MachineState::Starting,
        _ => MachineState::Stopped,
    }
}

/// Surface the socket error behind a failed connect with its original kind.
fn into_io_error(err: reqwest::Error) -> io::Error {
    if err.is_connect() {
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                return io::Error::new(io_err.kind(), err.to_string());
            }
            source = cause.source();
        }
    }
    let kind = if err.is_timeout() {
        io::ErrorKind::TimedOut
    } else if err.is_decode() {
        io::ErrorKind::InvalidData
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, err.to_string())
}

fn free_local_port() -> Result<u16> {
    let listener =
        TcpListener::bind(("127.0.0.1", 0)).context("reserving a port for the vfkit API")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing::record;
    use std::io::{BufRead, BufReader, Write};
    use std::thread;
    use tempfile::TempDir;

    /// Answer `n` requests with whatever `respond` renders for the body,
    /// returning the port and the request lines seen.
    fn serve(
        n: usize,
        respond: fn(&str) -> String,
        body: String,
    ) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut request_lines = vec![];
            for _ in 0..n {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                request_lines.push(line.trim_end().to_string());
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    if header == "\r\n" || header.is_empty() {
                        break;
                    }
                }
                let mut stream = reader.into_inner();
                stream.write_all(respond(&body).as_bytes()).unwrap();
                stream.flush().unwrap();
            }
            request_lines
        });
        (port, handle)
    }

    fn state_body(state: &str) -> String {
        format!(r#"{{"state":"{state}","canStart":false,"canPause":true}}"#)
    }

    fn content_length(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn chunked(body: &str) -> String {
        let (head, tail) = body.split_at(body.len() / 2);
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n{:x}\r\n{head}\r\n{:x}\r\n{tail}\r\n0\r\n\r\n",
            head.len(),
            tail.len()
        )
    }

    fn server_error(_body: &str) -> String {
        "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            .to_string()
    }

    fn serve_state(state: &str, n: usize) -> (u16, thread::JoinHandle<Vec<String>>) {
        serve(n, content_length, state_body(state))
    }

    fn unused_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn tcp(port: u16) -> ControlEndpoint {
        ControlEndpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        }
    }

    fn provider(tmp: &TempDir) -> AppleHvProvider {
        AppleHvProvider::new(PathBuf::from("/usr/bin/false"), MachineStore::new(tmp.path()))
    }

    #[test]
    fn probe_reads_running_state() {
        let (port, server) = serve_state("VirtualMachineStateRunning", 1);
        assert_eq!(rest_state("127.0.0.1", port).unwrap(), MachineState::Running);
        assert_eq!(server.join().unwrap(), ["GET /vm/state HTTP/1.1"]);
    }

    #[test]
    fn state_query_decodes_chunked_responses() {
        let (port, server) = serve(1, chunked, state_body("VirtualMachineStateStarting"));
        assert_eq!(rest_state("127.0.0.1", port).unwrap(), MachineState::Starting);
        server.join().unwrap();
    }

    #[test]
    fn refused_connection_keeps_its_error_kind() {
        let err = rest_state("127.0.0.1", unused_port()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn error_status_aborts_listing() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        let (port, server) = serve(1, server_error, String::new());
        provider.store.create(&record("broken", tcp(port))).unwrap();

        let err = provider.list(&ListOptions::default()).unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
        server.join().unwrap();
    }

    #[test]
    fn unknown_vfkit_states_are_stopped() {
        assert_eq!(map_vfkit_state("VirtualMachineStateStarting"), MachineState::Starting);
        assert_eq!(map_vfkit_state("VirtualMachineStatePaused"), MachineState::Stopped);
        assert_eq!(map_vfkit_state("VirtualMachineStateStopped"), MachineState::Stopped);
    }

    #[test]
    fn refused_probe_lists_as_stopped() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        provider.store.create(&record("dev", tcp(unused_port()))).unwrap();

        let listed = provider.list(&ListOptions::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, MachineState::Stopped);
        assert!(!listed[0].running() && !listed[0].starting());
        assert_eq!(provider.check_exclusive_active_vm().unwrap(), None);
    }

    #[test]
    fn running_machine_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        let (port, server) = serve_state("VirtualMachineStateRunning", 1);
        provider.store.create(&record("busy", tcp(port))).unwrap();
        provider.store.create(&record("idle", tcp(unused_port()))).unwrap();

        assert_eq!(
            provider.check_exclusive_active_vm().unwrap(),
            Some("busy".to_string())
        );
        server.join().unwrap();
    }

    #[test]
    fn transient_args_gui_debug() {
        let spec = VmSpec {
            cpus: 4,
            memory_mib: 4096,
            disk: PathBuf::from("/cache/clone.raw"),
            gui: true,
            debug: true,
        };
        let args = transient_args(&spec, Path::new("/tmp/efi/applehv-transient"));
        assert_eq!(
            args,
            [
                "--cpus",
                "4",
                "--memory",
                "4096",
                "--bootloader",
                "efi,variable-store=/tmp/efi/applehv-transient,create",
                "--device",
                "virtio-rng",
                "--device",
                "virtio-blk,path=/cache/clone.raw",
                "--device",
                "virtio-gpu,width=800,height=600",
                "--device",
                "virtio-input,pointing",
                "--device",
                "virtio-input,keyboard",
                "--restful-uri=none://",
                "--gui",
                "--log-level",
                "debug",
            ]
        );
    }

    #[test]
    fn transient_args_headless() {
        let spec = VmSpec {
            cpus: 2,
            memory_mib: 2048,
            disk: PathBuf::from("/d"),
            gui: false,
            debug: false,
        };
        let args = transient_args(&spec, Path::new("/efi"));
        assert!(args.ends_with(&[
            "--device".to_string(),
            "virtio-serial,stdio".to_string(),
            "--restful-uri=none://".to_string(),
        ]));
        assert!(!args.iter().any(|a| a == "--gui"));
    }

    #[test]
    fn hypervisor_failure_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let provider =
            AppleHvProvider::new(PathBuf::from("false"), MachineStore::new(tmp.path()));
        provider
            .spawn_transient(&VmSpec {
                cpus: 1,
                memory_mib: 512,
                disk: tmp.path().join("disk"),
                gui: false,
                debug: false,
            })
            .unwrap();
    }

    #[test]
    fn new_machine_records_devices_in_order() {
        let tmp = TempDir::new().unwrap();
        let provider = provider(&tmp);
        let rec = provider
            .new_machine(&InitOptions {
                name: "dev".into(),
                cpus: 2,
                memory_mib: 2048,
                disk_size_gib: 20,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(rec.devices.len(), 5);
        assert_eq!(rec.devices[0], "virtio-rng");
        assert!(rec.devices[3].starts_with("virtio-vsock,port=1025,"));
        assert!(rec.devices[4].starts_with("virtio-vsock,port=1024,"));
        assert!(provider.is_valid_vm_name("dev").unwrap());
        assert_eq!(provider.load_vm_by_name("dev").unwrap(), rec);

        let dup = provider
            .new_machine(&InitOptions {
                name: "dev".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(
            dup.downcast_ref::<VmrunError>(),
            Some(VmrunError::MachineExists(_))
        ));
    }

    #[test]
    fn usb_passthrough_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = provider(&tmp)
            .new_machine(&InitOptions {
                name: "usb".into(),
                usb_devices: vec!["vendor=1234,product=5678".into()],
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("USB host passthrough"));
    }

    #[test]
    fn cleanup_reports_not_implemented() {
        let tmp = TempDir::new().unwrap();
        let err = provider(&tmp).remove_and_clean_machines().unwrap_err();
        assert!(VmrunError::is_not_implemented(&err));
        assert!(!provider(&tmp).is_valid_vm_name("ghost").unwrap());
    }
}
