//! qemu-backed instance lifecycle.
//!
//! Creation is a straight-line pipeline: admission, directory, SSH keys,
//! callback listener, cloud-init rendering, base image acquisition, ISO and
//! rootfs assembly, boot, then the first-boot wait. Any failure after the
//! instance directory exists removes it again, so a failed create leaves no
//! trace; the removal is disarmed only once the guest reports success.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Backend, CreateArgs, CreateResult, InstanceDetails};
use crate::error::HutchError;
use crate::host::{check_admission, HostProbe, ProcHost};
use crate::image::{self, DownloadRequest};
use crate::workload::{create_workload, restore_workload, VmSpec, Workload};
use crate::workspace::{resolve_workspace, Workspace};
use crate::{cloudinit, iso, monitor, paths, rootfs, ssh, vm};

pub struct QemuBackend {
    root: PathBuf,
    host: Box<dyn HostProbe>,
}

impl QemuBackend {
    pub fn new() -> Self {
        Self::with_root(paths::data_dir(), Box::new(ProcHost))
    }

    /// Construct against an explicit data root and host probe.
    pub fn with_root(root: PathBuf, host: Box<dyn HostProbe>) -> Self {
        Self { root, host }
    }

    fn workspace_for(&self, name: &str, args: Option<&CreateArgs>) -> Result<Workspace, HutchError> {
        let mut ws = resolve_workspace(&self.root, name)?;
        if let Some(args) = args {
            ws.http_proxy = args.http_proxy.clone();
            ws.https_proxy = args.https_proxy.clone();
            ws.no_proxy = args.no_proxy.clone();
            ws.package_upgrade = args.update;
        }
        Ok(ws)
    }

    /// Load the instance's persisted state, reporting a lifecycle error
    /// when the instance does not exist.
    fn restore_existing(&self, name: &str) -> Result<(Workspace, Workload), HutchError> {
        let ws = self.workspace_for(name, None)?;
        if !ws.instance_dir.exists() {
            return Err(HutchError::NotFound {
                name: name.to_string(),
            });
        }
        let workload = restore_workload(&ws.instance_dir)?;
        Ok((ws, workload))
    }
}

impl Default for QemuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for QemuBackend {
    async fn create_instance(
        &self,
        cancel: &CancellationToken,
        result_tx: &mpsc::Sender<CreateResult>,
        download_tx: &mpsc::Sender<DownloadRequest>,
        args: CreateArgs,
    ) -> Result<(), HutchError> {
        let mut ws = self.workspace_for(&args.name, Some(&args))?;

        let mut workload = create_workload(&self.root, &args.workload)?;
        workload.state.vm.merge_overrides(&args.custom);
        workload.state.vm.fill_defaults();
        ws.mounts = workload.state.vm.mounts.clone();
        ws.derive_no_proxy();

        if ws.instance_dir.exists() {
            return Err(HutchError::AlreadyExists {
                name: args.name.clone(),
            });
        }

        check_admission(
            &workload.state.vm,
            workload.state.needs_nested_vm,
            self.host.as_ref(),
        )?;

        std::fs::create_dir_all(&ws.instance_dir).map_err(|e| {
            HutchError::io(
                format!("creating instance dir {}", ws.instance_dir.display()),
                e,
            )
        })?;
        let mut guard = DirGuard::arm(&ws.instance_dir);

        ssh::prepare_ssh_keys(&ws)?;

        let (listener, port) = monitor::create_local_listener().await?;
        let mut listener = Some(listener);
        ws.http_server_port = port;

        cloudinit::render_cloud_config(&mut workload, &ws)?;
        workload.persist(&ws.instance_dir)?;

        let client = ws.http_client()?;

        let _ = result_tx
            .send(CreateResult::line(format!(
                "Downloading {}\n",
                workload.state.base_image_name
            )))
            .await;
        let progress_tx = result_tx.clone();
        let image_path = image::fetch(
            cancel,
            download_tx,
            &client,
            &workload.state.base_image_url,
            move |p| {
                let _ = progress_tx.try_send(CreateResult::download_progress(p));
            },
        )
        .await?;

        iso::build_installation_image(cancel, result_tx, &workload.merged_user_data, &ws, args.debug)
            .await?;
        rootfs::materialize_rootfs(cancel, &image_path, &ws.instance_dir, workload.state.vm.disk_gib)
            .await?;

        let _ = result_tx
            .send(CreateResult::line(format!(
                "Booting VM with {} MiB RAM and {} cpus\n",
                workload.state.vm.mem_mib, workload.state.vm.cpus
            )))
            .await;
        let ssh_port = vm::boot_vm(cancel, &ws, &workload.state.vm).await?;

        // The assigned port must survive into later operations; losing it
        // would strand a running VM, so this persist is fatal.
        workload.state.vm.ssh_port = Some(ssh_port);
        workload.persist(&ws.instance_dir)?;

        // The monitor owns the listener from here on.
        let listener = listener
            .take()
            .ok_or_else(|| HutchError::Transport {
                message: "installation listener already consumed".into(),
                source: "listener handoff".into(),
            })?;
        monitor::monitor_installation(
            cancel,
            result_tx,
            download_tx,
            &client,
            listener,
            &ws.instance_dir,
        )
        .await?;

        guard.disarm();

        let _ = result_tx
            .send(CreateResult::line("VM successfully created!\n"))
            .await;
        tracing::info!(name = %args.name, ssh_port, "instance created");
        Ok(())
    }

    async fn start(
        &self,
        cancel: &CancellationToken,
        name: &str,
        custom: VmSpec,
    ) -> Result<(), HutchError> {
        let (mut ws, mut workload) = self.restore_existing(name)?;
        workload.state.vm.merge_overrides(&custom);
        workload.state.vm.fill_defaults();
        ws.mounts = workload.state.vm.mounts.clone();

        check_admission(
            &workload.state.vm,
            workload.state.needs_nested_vm,
            self.host.as_ref(),
        )?;

        // The VM boots fine even if the updated spec cannot be recorded.
        if let Err(e) = workload.persist(&ws.instance_dir) {
            tracing::warn!(name, "could not persist updated instance state: {e}");
        }

        let ssh_port = vm::boot_vm(cancel, &ws, &workload.state.vm).await?;

        if workload.state.vm.ssh_port != Some(ssh_port) {
            workload.state.vm.ssh_port = Some(ssh_port);
            if let Err(e) = workload.persist(&ws.instance_dir) {
                tracing::warn!(name, "could not persist SSH port: {e}");
            }
        }
        Ok(())
    }

    async fn stop(&self, cancel: &CancellationToken, name: &str) -> Result<(), HutchError> {
        let (ws, _workload) = self.restore_existing(name)?;
        vm::stop_vm(cancel, &ws.instance_dir).await
    }

    async fn quit(&self, cancel: &CancellationToken, name: &str) -> Result<(), HutchError> {
        let (ws, _workload) = self.restore_existing(name)?;
        vm::quit_vm(cancel, &ws.instance_dir).await
    }

    async fn status(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<InstanceDetails, HutchError> {
        if cancel.is_cancelled() {
            return Err(HutchError::Cancelled);
        }
        let (ws, workload) = self.restore_existing(name)?;

        // An instance whose boot never completed has no recorded port and
        // cannot be connected to.
        let ssh_port = workload.state.vm.ssh_port.ok_or_else(|| HutchError::State {
            name: name.to_string(),
        })?;

        Ok(InstanceDetails {
            name: name.to_string(),
            workload_name: workload.state.workload_name,
            ssh_port,
            key_path: ws.key_path,
            vm: workload.state.vm,
        })
    }

    async fn delete_instance(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<(), HutchError> {
        let ws = self.workspace_for(name, None)?;

        // A VM that is not running makes the quit fail; deletion proceeds
        // regardless.
        if let Err(e) = vm::quit_vm(cancel, &ws.instance_dir).await {
            tracing::debug!(name, "quit before delete failed: {e}");
        }

        match std::fs::remove_dir_all(&ws.instance_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(HutchError::io(
                    format!("removing instance dir {}", ws.instance_dir.display()),
                    e,
                ));
            }
        }
        tracing::info!(name, "instance deleted");
        Ok(())
    }
}

/// Removes the instance directory on drop unless disarmed.
struct DirGuard {
    dir: PathBuf,
    armed: bool,
}

impl DirGuard {
    fn arm(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %self.dir.display(), "cleanup failed: {e}");
                }
            }
        }
    }
}
