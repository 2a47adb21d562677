//! Per-operation derived context for an instance.
//!
//! A `Workspace` is recomputed from the instance name on every operation —
//! it is never persisted. It carries the filesystem layout, proxy settings
//! and the callback port the guest uses to reach the host during first boot.

use std::path::{Path, PathBuf};

use crate::error::HutchError;
use crate::paths;
use crate::workload::Mount;

/// Gateway address of qemu's user-mode network, as seen from the guest.
pub const HOST_GATEWAY: &str = "10.0.2.2";

#[derive(Debug, Clone)]
pub struct Workspace {
    pub instance_dir: PathBuf,
    pub key_path: PathBuf,
    pub hostname: String,
    pub mounts: Vec<Mount>,
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
    pub package_upgrade: bool,
    /// Port of the in-guest installation callback listener. Zero until the
    /// listener is bound.
    pub http_server_port: u16,
}

/// Derive the workspace for `name` under the given data root.
pub fn resolve_workspace(root: &Path, name: &str) -> Result<Workspace, HutchError> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        return Err(HutchError::io(
            format!("invalid instance name '{name}'"),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad name"),
        ));
    }

    let instance_dir = paths::instance_dir(root, name);
    let key_path = instance_dir.join("id_ed25519");

    Ok(Workspace {
        instance_dir,
        key_path,
        hostname: name.to_string(),
        mounts: Vec::new(),
        http_proxy: String::new(),
        https_proxy: String::new(),
        no_proxy: String::new(),
        package_upgrade: false,
        http_server_port: 0,
    })
}

impl Workspace {
    /// Append the instance hostname and the host-side gateway to the
    /// no-proxy list, so in-guest traffic to the callback listener never
    /// goes through a proxy.
    pub fn derive_no_proxy(&mut self) {
        if !self.no_proxy.is_empty() {
            self.no_proxy = format!("{},{},{HOST_GATEWAY}", self.hostname, self.no_proxy);
        } else if !self.http_proxy.is_empty() || !self.https_proxy.is_empty() {
            self.no_proxy = format!("{},{HOST_GATEWAY}", self.hostname);
        }
    }

    /// Build an HTTP client honoring the workspace proxy settings.
    pub fn http_client(&self) -> Result<reqwest::Client, HutchError> {
        let mut builder = reqwest::Client::builder();
        let no_proxy = reqwest::NoProxy::from_string(&self.no_proxy);
        if !self.http_proxy.is_empty() {
            let proxy = reqwest::Proxy::http(&self.http_proxy)
                .map_err(|e| HutchError::Transport {
                    message: format!("invalid http proxy '{}'", self.http_proxy),
                    source: Box::new(e),
                })?
                .no_proxy(no_proxy.clone());
            builder = builder.proxy(proxy);
        }
        if !self.https_proxy.is_empty() {
            let proxy = reqwest::Proxy::https(&self.https_proxy)
                .map_err(|e| HutchError::Transport {
                    message: format!("invalid https proxy '{}'", self.https_proxy),
                    source: Box::new(e),
                })?
                .no_proxy(no_proxy);
            builder = builder.proxy(proxy);
        }
        builder.build().map_err(|e| HutchError::Transport {
            message: "building HTTP client".into(),
            source: Box::new(e),
        })
    }
}
