//! Backend abstraction for instance lifecycle operations.
//!
//! A backend owns the mechanics of creating, booting and destroying
//! instances. The caller wires up the channels: a Result sink receiving
//! human-readable progress lines during creation, and a download sink
//! feeding the serial download coordinator.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::HutchError;
use crate::image::{DownloadRequest, Progress};
use crate::workload::VmSpec;

mod qemu;

pub use qemu::QemuBackend;

/// One line of creation progress, delivered in order to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateResult {
    pub line: String,
}

impl CreateResult {
    pub fn line(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }

    /// Render a download progress record the way it is reported to users.
    pub fn download_progress(p: Progress) -> Self {
        let downloaded_mb = p.downloaded / (1024 * 1024);
        let line = match p.total {
            Some(total) => {
                format!("Downloaded {} MB of {}\n", downloaded_mb, total / (1024 * 1024))
            }
            None => format!("Downloaded {downloaded_mb} MB\n"),
        };
        Self { line }
    }
}

/// Caller-supplied parameters for instance creation.
#[derive(Debug, Clone, Default)]
pub struct CreateArgs {
    pub name: String,
    pub workload: String,
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
    /// Run a full package upgrade during first boot.
    pub update: bool,
    /// Keep intermediate artifacts for inspection.
    pub debug: bool,
    /// Per-instance overrides applied on top of the workload's VM spec.
    pub custom: VmSpec,
}

/// Snapshot of an existing instance, as reported by `status`.
#[derive(Debug, Clone)]
pub struct InstanceDetails {
    pub name: String,
    pub workload_name: String,
    pub ssh_port: u16,
    pub key_path: PathBuf,
    pub vm: VmSpec,
}

#[allow(async_fn_in_trait)]
pub trait Backend {
    /// Run the full creation pipeline for a new instance. Progress lines
    /// go to `result_tx`; downloads are delegated through `download_tx`.
    async fn create_instance(
        &self,
        cancel: &CancellationToken,
        result_tx: &mpsc::Sender<CreateResult>,
        download_tx: &mpsc::Sender<DownloadRequest>,
        args: CreateArgs,
    ) -> Result<(), HutchError>;

    /// Boot a previously created instance, applying any overrides.
    async fn start(
        &self,
        cancel: &CancellationToken,
        name: &str,
        custom: VmSpec,
    ) -> Result<(), HutchError>;

    /// Ask the guest OS for a graceful shutdown.
    async fn stop(&self, cancel: &CancellationToken, name: &str) -> Result<(), HutchError>;

    /// Terminate the VM process without consulting the guest.
    async fn quit(&self, cancel: &CancellationToken, name: &str) -> Result<(), HutchError>;

    /// Report the instance's connection details.
    async fn status(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<InstanceDetails, HutchError>;

    /// Tear the instance down and remove its on-disk footprint.
    async fn delete_instance(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<(), HutchError>;
}

/// Construct the default backend over the user's data and cache dirs.
pub fn create_backend() -> QemuBackend {
    QemuBackend::new()
}
