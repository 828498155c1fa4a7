//! Persisted machine records and transient VM specs.
//!
//! Records are JSON files, one per machine, in a per-backend directory. They
//! describe how to reach the machine's control endpoint; live state is never
//! stored and always comes from probing that endpoint.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::error::VmrunError;

/// Live state of a persistent machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Stopped,
    Starting,
    Running,
}

impl MachineState {
    /// Running and Starting machines hold the backend's single active slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
        })
    }
}

/// How to reach a machine's administrative endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEndpoint {
    /// HTTP control API on a TCP port (vfkit).
    Tcp { host: String, port: u16 },
    /// Line-oriented JSON protocol on a Unix socket (QEMU QMP).
    Unix { path: PathBuf },
}

impl ControlEndpoint {
    /// Form accepted by vfkit's `--restful-uri`.
    pub fn to_uri(&self) -> String {
        match self {
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
            Self::Unix { path } => format!("unix://{}", path.display()),
        }
    }
}

/// A persisted machine definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    pub name: String,
    pub cpus: u16,
    pub memory_mib: u64,
    pub disk_size_gib: u64,
    pub disk_path: PathBuf,
    pub created_unix: u64,
    #[serde(default)]
    pub last_up_unix: Option<u64>,
    pub endpoint: ControlEndpoint,
    /// Devices in attachment order, rendered for the backend.
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub image_stream: Option<String>,
}

/// Parameters for creating a machine record.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub name: String,
    pub cpus: u16,
    pub memory_mib: u64,
    pub disk_size_gib: u64,
    pub image_path: Option<PathBuf>,
    pub image_stream: Option<String>,
    pub usb_devices: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {}

/// One row of `list` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListResponse {
    pub name: String,
    pub vm_type: String,
    pub state: MachineState,
    pub cpus: u16,
    pub memory_bytes: u64,
    pub disk_size_bytes: u64,
    pub created_unix: u64,
    pub last_up_unix: Option<u64>,
    pub image_stream: Option<String>,
}

impl ListResponse {
    pub fn running(&self) -> bool {
        self.state == MachineState::Running
    }

    pub fn starting(&self) -> bool {
        self.state == MachineState::Starting
    }
}

/// Resources and options for a single transient launch. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub cpus: u16,
    pub memory_mib: u64,
    pub disk: PathBuf,
    pub gui: bool,
    pub debug: bool,
}

/// Directory of `<name>.json` machine records.
#[derive(Debug, Clone)]
pub struct MachineStore {
    dir: PathBuf,
}

impl MachineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.record_path(name)?.is_file())
    }

    pub fn load(&self, name: &str) -> Result<MachineRecord> {
        let path = self.record_path(name)?;
        match fs::read(&path) {
            Ok(bytes) => parse_record(&path, &bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(VmrunError::MachineNotFound(name.to_string()).into())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// All records, sorted by name. A missing directory means no machines.
    pub fn load_all(&self) -> Result<Vec<MachineRecord>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut records = vec![];
        for ent in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let ent = ent.with_context(|| format!("Failed to read {}", self.dir.display()))?;
            let path = ent.path();
            if !ent.file_type().is_file()
                || path.extension().and_then(|s| s.to_str()) != Some("json")
            {
                continue;
            }
            let bytes =
                fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            records.push(parse_record(path, &bytes)?);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Write a new record; refuses to overwrite an existing machine.
    pub fn create(&self, record: &MachineRecord) -> Result<()> {
        let path = self.record_path(&record.name)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating machine directory {}", self.dir.display()))?;
        if path.exists() {
            return Err(VmrunError::MachineExists(record.name.clone()).into());
        }
        self.write(&path, record)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.record_path(name)?;
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))
    }

    fn write(&self, path: &Path, record: &MachineRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        io::Write::write_all(&mut tmp, &bytes)?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

fn parse_record(path: &Path, bytes: &[u8]) -> Result<MachineRecord> {
    serde_json::from_slice(bytes)
        .with_context(|| format!("Failed to parse machine record {}", path.display()))
}

/// Machine names become filenames, so they must be a single safe segment.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
        || name.chars().any(char::is_control)
    {
        return Err(VmrunError::InvalidMachineName(name.to_string()).into());
    }
    Ok(())
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
