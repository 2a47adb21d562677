use clap::{Parser, Subcommand};

use crate::error::HutchError;
use crate::workload::{Mount, VmSpec};

#[derive(Parser, Debug)]
#[command(name = "hutch", about = "Ephemeral development VMs on qemu")]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new instance and wait for first boot to finish
    Create {
        /// Instance name
        name: String,

        /// Workload definition to instantiate
        #[arg(long, default_value = "default")]
        workload: String,

        /// Memory in MiB (overrides the workload)
        #[arg(long)]
        mem: Option<u32>,

        /// Number of CPUs (overrides the workload)
        #[arg(long)]
        cpus: Option<u32>,

        /// Boot disk size in GiB (overrides the workload)
        #[arg(long)]
        disk: Option<u32>,

        /// Host directory exported to the guest, as tag:path (repeatable)
        #[arg(long)]
        mount: Vec<String>,

        /// HTTP proxy for downloads and in-guest traffic
        #[arg(long)]
        http_proxy: Option<String>,

        /// HTTPS proxy for downloads and in-guest traffic
        #[arg(long)]
        https_proxy: Option<String>,

        /// Comma-separated hosts that bypass the proxy
        #[arg(long)]
        no_proxy: Option<String>,

        /// Run a full package upgrade during first boot
        #[arg(long)]
        update: bool,

        /// Keep intermediate build artifacts for inspection
        #[arg(long)]
        debug: bool,
    },

    /// Boot an existing instance
    Start {
        name: String,

        /// Memory in MiB (overrides the recorded spec)
        #[arg(long)]
        mem: Option<u32>,

        /// Number of CPUs (overrides the recorded spec)
        #[arg(long)]
        cpus: Option<u32>,

        /// Boot disk size in GiB (overrides the recorded spec)
        #[arg(long)]
        disk: Option<u32>,

        /// Host directory exported to the guest, as tag:path (repeatable;
        /// replaces the recorded mounts)
        #[arg(long)]
        mount: Vec<String>,
    },

    /// Ask the guest OS for a clean shutdown
    Stop { name: String },

    /// Terminate the VM immediately
    Quit { name: String },

    /// Show an instance's connection details
    Status { name: String },

    /// Remove an instance and all its on-disk state
    Delete { name: String },
}

/// Parse repeated `tag:path` mount flags.
pub fn parse_mounts(flags: &[String]) -> Result<Vec<Mount>, HutchError> {
    flags
        .iter()
        .map(|flag| {
            let (tag, path) = flag.split_once(':').ok_or_else(|| HutchError::io(
                format!("invalid mount '{flag}', expected tag:path"),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad mount flag"),
            ))?;
            if tag.is_empty() || path.is_empty() {
                return Err(HutchError::io(
                    format!("invalid mount '{flag}', expected tag:path"),
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad mount flag"),
                ));
            }
            Ok(Mount {
                tag: tag.to_string(),
                path: path.to_string(),
            })
        })
        .collect()
}

/// Collapse Option-valued CLI overrides into the zero-means-unset spec.
pub fn overrides(mem: Option<u32>, cpus: Option<u32>, disk: Option<u32>, mounts: Vec<Mount>) -> VmSpec {
    VmSpec {
        mem_mib: mem.unwrap_or(0),
        cpus: cpus.unwrap_or(0),
        disk_gib: disk.unwrap_or(0),
        mounts,
        ssh_port: None,
    }
}
