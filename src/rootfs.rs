//! Rootfs materialization.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::error::HutchError;

/// Filename of the instance's boot disk inside the instance directory.
pub const ROOTFS_NAME: &str = "rootfs.qcow2";

/// Produce the guest's boot disk: a qcow2 overlay backed by the downloaded
/// base image, sized to the requested capacity.
pub async fn materialize_rootfs(
    cancel: &CancellationToken,
    image_path: &Path,
    instance_dir: &Path,
    disk_gib: u32,
) -> Result<(), HutchError> {
    if cancel.is_cancelled() {
        return Err(HutchError::Cancelled);
    }

    let rootfs = instance_dir.join(ROOTFS_NAME);

    let mut cmd = tokio::process::Command::new("qemu-img");
    cmd.args(["create", "-f", "qcow2", "-b"])
        .arg(image_path)
        .args(["-F", "qcow2"])
        .arg(&rootfs)
        .arg(format!("{disk_gib}G"));

    let output = tokio::select! {
        output = cmd.output() => output
            .map_err(|e| HutchError::io("running qemu-img", e))?,
        _ = cancel.cancelled() => return Err(HutchError::Cancelled),
    };

    if !output.status.success() {
        return Err(HutchError::ExternalTool {
            tool: "qemu-img".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    tracing::info!(path = %rootfs.display(), size_gib = disk_gib, "materialized rootfs");
    Ok(())
}
