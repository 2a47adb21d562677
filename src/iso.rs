//! Installation ISO assembly.
//!
//! Stages the rendered cloud-init files into the instance directory and
//! packs them into an ISO 9660 image labeled `CIDATA`, which qemu attaches
//! as a cdrom for the NoCloud datasource.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::CreateResult;
use crate::cloudinit;
use crate::error::HutchError;
use crate::workspace::Workspace;

/// Filename of the finished seed ISO inside the instance directory.
pub const ISO_NAME: &str = "cidata.iso";

/// Write `user-data`, `meta-data` and `network-config` into a staging
/// directory beneath the instance dir. Returns the staging path.
pub fn stage_files(user_data: &str, ws: &Workspace) -> Result<PathBuf, HutchError> {
    let staging = ws.instance_dir.join("cidata");
    std::fs::create_dir_all(&staging)
        .map_err(|e| HutchError::io(format!("creating {}", staging.display()), e))?;

    let meta_data = cloudinit::build_meta_data(ws);
    let network_config =
        "version: 2\nethernets:\n  id0:\n    match:\n      name: \"en*\"\n    dhcp4: true\n";

    for (name, data) in [
        ("user-data", user_data),
        ("meta-data", meta_data.as_str()),
        ("network-config", network_config),
    ] {
        let path = staging.join(name);
        std::fs::write(&path, data)
            .map_err(|e| HutchError::io(format!("writing {}", path.display()), e))?;
    }

    Ok(staging)
}

/// Build the installation ISO from the rendered user-data.
///
/// Uses `xorriso` when present and falls back to `genisoimage`. With
/// `debug` set the staging directory is kept for inspection.
pub async fn build_installation_image(
    cancel: &CancellationToken,
    result_tx: &mpsc::Sender<CreateResult>,
    user_data: &str,
    ws: &Workspace,
    debug: bool,
) -> Result<(), HutchError> {
    if cancel.is_cancelled() {
        return Err(HutchError::Cancelled);
    }

    let staging = stage_files(user_data, ws)?;
    let iso_path = ws.instance_dir.join(ISO_NAME);

    let _ = result_tx
        .send(CreateResult::line("Building installation image\n"))
        .await;

    let result = run_mkisofs(cancel, &staging, &iso_path).await;

    if !debug {
        let _ = std::fs::remove_dir_all(&staging);
    }

    result
}

async fn run_mkisofs(
    cancel: &CancellationToken,
    staging: &Path,
    iso_path: &Path,
) -> Result<(), HutchError> {
    let candidates: [(&str, Vec<&str>); 2] = [
        ("xorriso", vec!["-as", "mkisofs"]),
        ("genisoimage", vec![]),
    ];

    let mut last_err = None;
    for (tool, prefix) in candidates {
        let mut cmd = tokio::process::Command::new(tool);
        cmd.args(&prefix)
            .args(["-output"])
            .arg(iso_path)
            .args(["-volid", "CIDATA", "-joliet", "-rock"])
            .arg(staging);

        let output = tokio::select! {
            output = cmd.output() => output,
            _ = cancel.cancelled() => return Err(HutchError::Cancelled),
        };

        match output {
            Ok(out) if out.status.success() => return Ok(()),
            Ok(out) => {
                return Err(HutchError::ExternalTool {
                    tool: tool.into(),
                    message: String::from_utf8_lossy(&out.stderr).into_owned(),
                });
            }
            // Tool not installed: try the next candidate.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                last_err = Some(e);
            }
            Err(e) => return Err(HutchError::io(format!("running {tool}"), e)),
        }
    }

    Err(HutchError::ExternalTool {
        tool: "xorriso/genisoimage".into(),
        message: format!(
            "no ISO tool found: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ),
    })
}
