use std::path::PathBuf;

use anyhow::Result;
use bootc_vmrun::config::VmrunConfig;
use bootc_vmrun::disk::{ContainerInstaller, DiskCache};
use bootc_vmrun::engine::podman_from_config;
use bootc_vmrun::run::{RunOptions, TransientVmRunner};
use bootc_vmrun::{logging, provider};
use clap::Parser;

/// Run a bootable container image in a transient virtual machine.
///
/// Prints the cached disk path, then stays attached to the VM until it exits.
#[derive(Debug, Parser)]
#[command(name = "bootc-vmrun", version)]
struct Cli {
    /// Container image to boot.
    image: String,

    /// Log level passed to bootc as RUST_LOG while generating the disk.
    #[arg(long)]
    bootc_log_level: Option<String>,

    /// Verbose logging here and in the hypervisor.
    #[arg(long)]
    vmdebug: bool,

    /// Console on this terminal instead of a graphical window.
    #[arg(long)]
    headless: bool,

    #[arg(long)]
    cpus: Option<u16>,

    /// Memory in MiB.
    #[arg(long)]
    memory: Option<u64>,

    /// Container engine connection to use.
    #[arg(long)]
    connection: Option<String>,

    /// Config file instead of the default location.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.vmdebug { "debug" } else { "info" });

    let mut config = VmrunConfig::load(cli.config.as_deref())?;
    if let Some(connection) = cli.connection {
        config.engine.connection = Some(connection);
    }

    let engine = podman_from_config(&config.engine)?;
    let provider = provider::for_host(&config)?;
    let cache = DiskCache::new(
        config.cache_dir()?,
        ContainerInstaller::new(&engine).with_log_level(cli.bootc_log_level),
    )
    .with_disk_size(config.disk_size_bytes);

    let opts = RunOptions {
        cpus: cli.cpus.unwrap_or(config.transient.cpus),
        memory_mib: cli.memory.unwrap_or(config.transient.memory_mib),
        gui: config.transient.gui && !cli.headless,
        debug: cli.vmdebug,
    };
    TransientVmRunner::new(&engine, &cache, &*provider).run(&cli.image, &opts)
}
