//! Narrow contract with the container engine.
//!
//! Only three things are needed from it: report an image's digest, pull an
//! image, and run a privileged one-shot container. `PodmanCli` does this by
//! invoking the `podman` binary.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::ExitStatus;
use tracing::{debug, info};

use crate::error::VmrunError;
use crate::process::Cmd;

/// Go template passed to `image inspect` to print just the digest.
const DIGEST_FORMAT: &str = "{{.Digest}}";

/// A bind mount of a host path into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: String,
}

/// One-shot container invocation.
#[derive(Debug, Clone, Default)]
pub struct ContainerRun {
    pub image: String,
    pub privileged: bool,
    pub pid_host: bool,
    pub security_opts: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<BindMount>,
    pub command: Vec<String>,
}

impl ContainerRun {
    /// Arguments following the engine binary (and connection flag).
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if self.privileged {
            args.push("--privileged".to_string());
        }
        if self.pid_host {
            args.push("--pid=host".to_string());
        }
        args.push("--rm".to_string());
        args.push("-i".to_string());
        for opt in &self.security_opts {
            args.push(format!("--security-opt={opt}"));
        }
        for (k, v) in &self.env {
            args.push(format!("--env={k}={v}"));
        }
        for mount in &self.mounts {
            args.push("-v".to_string());
            args.push(format!("{}:{}", mount.host.display(), mount.container));
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

pub trait ContainerEngine {
    /// Digest of a locally present image; errors if the image is absent.
    fn inspect_digest(&self, image: &str) -> Result<String>;

    fn pull(&self, image: &str) -> Result<()>;

    /// Run to completion with inherited stdio, returning the exit status.
    fn run(&self, spec: &ContainerRun) -> Result<ExitStatus>;
}

/// Engine backed by the `podman` command line.
#[derive(Debug, Clone)]
pub struct PodmanCli {
    binary: String,
    connection: Option<String>,
}

impl PodmanCli {
    pub fn new(binary: impl Into<String>, connection: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            connection,
        }
    }

    fn cmd<I, S>(&self, args: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Cmd::new(&self.binary);
        if let Some(connection) = &self.connection {
            cmd = cmd.arg(format!("--connection={connection}"));
        }
        cmd.args(args)
    }
}

impl ContainerEngine for PodmanCli {
    fn inspect_digest(&self, image: &str) -> Result<String> {
        let out = self
            .cmd(["image", "inspect", "-f", DIGEST_FORMAT, image])
            .error_msg(format!("Failed to inspect {image}"))
            .run()?;
        Ok(out.stdout.trim().to_string())
    }

    fn pull(&self, image: &str) -> Result<()> {
        let status = self
            .cmd(["pull", image])
            .error_msg(format!("Failed to pull {image}"))
            .run_interactive()?;
        if !status.success() {
            anyhow::bail!("{} pull {image} exited with {status}", self.binary);
        }
        Ok(())
    }

    fn run(&self, spec: &ContainerRun) -> Result<ExitStatus> {
        let cmd = self.cmd(spec.to_args());
        info!("Executing {}", cmd.display());
        cmd.run_interactive()
    }
}

/// Resolve the current digest of `image`, pulling it first if it is not
/// present locally.
pub fn resolve_digest(engine: &dyn ContainerEngine, image: &str) -> Result<String> {
    if let Err(err) = engine.inspect_digest(image) {
        debug!("Inspect failed: {err:#}");
        engine
            .pull(image)
            .map_err(|e| image_resolution(image, &e))?;
    }

    let digest = engine
        .inspect_digest(image)
        .map_err(|e| image_resolution(image, &e))?;
    if digest.is_empty() {
        return Err(VmrunError::ImageResolution {
            image: image.to_string(),
            reason: "engine reported an empty digest".to_string(),
        }
        .into());
    }
    Ok(digest)
}

fn image_resolution(image: &str, err: &anyhow::Error) -> anyhow::Error {
    VmrunError::ImageResolution {
        image: image.to_string(),
        reason: format!("{err:#}"),
    }
    .into()
}

/// Convenience used by the binary to build an engine from config values.
pub fn podman_from_config(config: &crate::config::EngineConfig) -> Result<PodmanCli> {
    which::which(&config.binary)
        .with_context(|| format!("container engine '{}' not found in PATH", config.binary))?;
    Ok(PodmanCli::new(&config.binary, config.connection.clone()))
}
