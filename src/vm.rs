//! VM process control.
//!
//! Boots the instance as a daemonized qemu process and drives later state
//! changes over its QMP socket: `system_powerdown` for a graceful stop,
//! `quit` for a forced termination.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::error::HutchError;
use crate::rootfs::ROOTFS_NAME;
use crate::workload::VmSpec;
use crate::workspace::Workspace;

const QEMU: &str = "qemu-system-x86_64";

/// QMP control socket inside the instance directory.
pub fn qmp_socket_path(instance_dir: &Path) -> PathBuf {
    instance_dir.join("qmp.socket")
}

/// Pick a free host port for the guest's SSH forward.
pub fn allocate_ssh_port() -> Result<u16, HutchError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| HutchError::io("allocating SSH port", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| HutchError::io("reading allocated SSH port", e))?
        .port();
    Ok(port)
}

/// Assemble the qemu command line for an instance.
pub fn build_qemu_args(ws: &Workspace, spec: &VmSpec, ssh_port: u16) -> Vec<String> {
    let instance_dir = &ws.instance_dir;
    let mut args = vec![
        "-name".into(),
        ws.hostname.clone(),
        "-machine".into(),
        "q35,accel=kvm".into(),
        "-cpu".into(),
        "host".into(),
        "-m".into(),
        format!("{}M", spec.mem_mib),
        "-smp".into(),
        spec.cpus.to_string(),
        "-drive".into(),
        format!(
            "file={},if=virtio,format=qcow2",
            instance_dir.join(ROOTFS_NAME).display()
        ),
        "-drive".into(),
        format!(
            "file={},media=cdrom,readonly=on",
            instance_dir.join(crate::iso::ISO_NAME).display()
        ),
        "-netdev".into(),
        format!("user,id=net0,hostfwd=tcp:127.0.0.1:{ssh_port}-:22"),
        "-device".into(),
        "virtio-net-pci,netdev=net0".into(),
    ];

    for (i, m) in spec.mounts.iter().enumerate() {
        args.push("-fsdev".into());
        args.push(format!(
            "local,security_model=none,id=fsdev{i},path={}",
            m.path
        ));
        args.push("-device".into());
        args.push(format!("virtio-9p-pci,fsdev=fsdev{i},mount_tag={}", m.tag));
    }

    args.extend([
        "-qmp".into(),
        format!("unix:{},server,nowait", qmp_socket_path(instance_dir).display()),
        "-pidfile".into(),
        instance_dir.join("qemu.pid").display().to_string(),
        "-display".into(),
        "none".into(),
        "-daemonize".into(),
    ]);

    args
}

/// Boot the VM. Returns the host port forwarded to the guest's SSH port —
/// the persisted port when one exists, a freshly allocated one otherwise.
pub async fn boot_vm(
    cancel: &CancellationToken,
    ws: &Workspace,
    spec: &VmSpec,
) -> Result<u16, HutchError> {
    if cancel.is_cancelled() {
        return Err(HutchError::Cancelled);
    }

    let ssh_port = match spec.ssh_port {
        Some(p) => p,
        None => allocate_ssh_port()?,
    };

    let args = build_qemu_args(ws, spec, ssh_port);
    tracing::debug!(name = %ws.hostname, ?args, "booting VM");

    let mut cmd = tokio::process::Command::new(QEMU);
    cmd.args(&args);

    let output = tokio::select! {
        output = cmd.output() => output
            .map_err(|e| HutchError::io(format!("running {QEMU}"), e))?,
        _ = cancel.cancelled() => return Err(HutchError::Cancelled),
    };

    if !output.status.success() {
        return Err(HutchError::ExternalTool {
            tool: QEMU.into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    tracing::info!(name = %ws.hostname, ssh_port, "VM booted");
    Ok(ssh_port)
}

/// Request a graceful ACPI shutdown.
pub async fn stop_vm(cancel: &CancellationToken, instance_dir: &Path) -> Result<(), HutchError> {
    qmp_command(cancel, instance_dir, "system_powerdown").await
}

/// Force-terminate the VM process.
pub async fn quit_vm(cancel: &CancellationToken, instance_dir: &Path) -> Result<(), HutchError> {
    qmp_command(cancel, instance_dir, "quit").await
}

/// Run a single QMP command against the instance's control socket.
///
/// QMP requires a `qmp_capabilities` negotiation before any command; both
/// responses are read but only checked for being present, since qemu
/// acknowledges `quit` with an event as it exits.
async fn qmp_command(
    cancel: &CancellationToken,
    instance_dir: &Path,
    command: &str,
) -> Result<(), HutchError> {
    let socket = qmp_socket_path(instance_dir);

    let run = async {
        let stream = UnixStream::connect(&socket)
            .await
            .map_err(|_| HutchError::ExternalTool {
                tool: "qmp".into(),
                message: format!(
                    "cannot reach VM control socket {}; is the VM running?",
                    socket.display()
                ),
            })?;

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // Server greeting.
        read_qmp_line(&mut lines).await?;

        write_half
            .write_all(b"{\"execute\":\"qmp_capabilities\"}\n")
            .await
            .map_err(|e| HutchError::io("writing QMP capabilities", e))?;
        read_qmp_line(&mut lines).await?;

        write_half
            .write_all(format!("{{\"execute\":\"{command}\"}}\n").as_bytes())
            .await
            .map_err(|e| HutchError::io(format!("sending QMP {command}"), e))?;
        // qemu may close the socket right after a quit; a missing reply is
        // not a failure for that command.
        let _ = read_qmp_line(&mut lines).await;

        Ok(())
    };

    tokio::select! {
        result = run => result,
        _ = cancel.cancelled() => Err(HutchError::Cancelled),
    }
}

async fn read_qmp_line(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
) -> Result<String, HutchError> {
    match lines.next_line().await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(HutchError::ExternalTool {
            tool: "qmp".into(),
            message: "control socket closed".into(),
        }),
        Err(e) => Err(HutchError::io("reading QMP response", e)),
    }
}
