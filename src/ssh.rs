//! SSH key provisioning for a new instance.

use std::os::unix::fs::PermissionsExt;

use ssh_key::{Algorithm, LineEnding, PrivateKey};

use crate::error::HutchError;
use crate::workspace::Workspace;

/// Generate an ed25519 keypair into the workspace.
///
/// Writes the private key (mode 0600) to `ws.key_path` and the public key
/// next to it with a `.pub` extension.
pub fn prepare_ssh_keys(ws: &Workspace) -> Result<(), HutchError> {
    let key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).map_err(|e| {
        HutchError::ExternalTool {
            tool: "ssh-keygen".into(),
            message: format!("generating ed25519 key: {e}"),
        }
    })?;

    let private = key.to_openssh(LineEnding::LF).map_err(|e| HutchError::ExternalTool {
        tool: "ssh-keygen".into(),
        message: format!("encoding private key: {e}"),
    })?;
    let public = key.public_key().to_openssh().map_err(|e| HutchError::ExternalTool {
        tool: "ssh-keygen".into(),
        message: format!("encoding public key: {e}"),
    })?;

    std::fs::write(&ws.key_path, private.as_bytes()).map_err(|e| {
        HutchError::io(format!("writing {}", ws.key_path.display()), e)
    })?;
    std::fs::set_permissions(&ws.key_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| HutchError::io(format!("chmod {}", ws.key_path.display()), e))?;

    let pub_path = ws.key_path.with_extension("pub");
    std::fs::write(&pub_path, format!("{public} hutch@{}\n", ws.hostname))
        .map_err(|e| HutchError::io(format!("writing {}", pub_path.display()), e))?;

    Ok(())
}

/// Read the instance's public key, if any.
pub fn public_key(ws: &Workspace) -> Option<String> {
    std::fs::read_to_string(ws.key_path.with_extension("pub"))
        .ok()
        .map(|k| k.trim().to_string())
}
