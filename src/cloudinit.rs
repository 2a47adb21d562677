//! Cloud-init configuration rendering.
//!
//! Builds the `#cloud-config` user-data and the NoCloud `meta-data` for an
//! instance from the merged workload and workspace. The guest reports
//! first-boot progress back to the host by POSTing to the callback listener
//! on qemu's gateway address; `FINISHED` (or `FAILED: ...`) is the final
//! signal the installation monitor waits for.

use facet_value::{VArray, Value, value};

use crate::error::HutchError;
use crate::ssh;
use crate::workload::Workload;
use crate::workspace::{HOST_GATEWAY, Workspace};

/// Body the guest sends when first boot completed successfully.
pub const FINISHED_MARKER: &str = "FINISHED";
/// Prefix of the body the guest sends when first boot failed.
pub const FAILED_PREFIX: &str = "FAILED";

/// NoCloud meta-data document.
pub fn build_meta_data(ws: &Workspace) -> String {
    let hostname = &ws.hostname;
    format!("instance-id: {hostname}\nlocal-hostname: {hostname}\n")
}

/// Render the merged user-data into the workload.
pub fn render_cloud_config(wkld: &mut Workload, ws: &Workspace) -> Result<(), HutchError> {
    wkld.merged_user_data = build_user_data(ws);
    Ok(())
}

fn callback_url(ws: &Workspace) -> String {
    format!("http://{HOST_GATEWAY}:{}/", ws.http_server_port)
}

fn report_cmd(ws: &Workspace, body: &str) -> Value {
    Value::from(VArray::from_iter([
        Value::from("curl"),
        Value::from("-s"),
        Value::from("-X"),
        Value::from("POST"),
        Value::from("--data"),
        Value::from(body),
        Value::from(callback_url(ws).as_str()),
    ]))
}

fn build_user_data(ws: &Workspace) -> String {
    let mut user = value!({
        "name": "hutch",
        "gecos": "hutch development user",
        "lock_passwd": true,
        "shell": "/bin/bash",
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
    });

    if let Some(key) = ssh::public_key(ws) {
        let keys = VArray::from_iter([Value::from(key.as_str())]);
        if let Some(obj) = user.as_object_mut() {
            obj.insert("ssh_authorized_keys", Value::from(keys));
        }
    }

    let mut write_files = VArray::new();

    if !ws.http_proxy.is_empty() || !ws.https_proxy.is_empty() {
        let mut env = String::new();
        if !ws.http_proxy.is_empty() {
            env.push_str(&format!("export http_proxy={}\n", ws.http_proxy));
        }
        if !ws.https_proxy.is_empty() {
            env.push_str(&format!("export https_proxy={}\n", ws.https_proxy));
        }
        if !ws.no_proxy.is_empty() {
            env.push_str(&format!("export no_proxy={}\n", ws.no_proxy));
        }
        write_files.push(value!({
            "path": "/etc/profile.d/hutch-proxy.sh",
            "content": (env.as_str()),
        }));
    }

    let mut runcmd = VArray::new();
    runcmd.push(report_cmd(ws, "Configuring guest"));

    // Create mount points before cloud-init processes the mount list.
    for m in &ws.mounts {
        runcmd.push(Value::from(VArray::from_iter([
            Value::from("mkdir"),
            Value::from("-p"),
            Value::from(m.path.as_str()),
        ])));
    }

    runcmd.push(report_cmd(ws, FINISHED_MARKER));

    let mut config = value!({
        "users": [user],
        "package_update": (ws.package_upgrade),
        "package_upgrade": (ws.package_upgrade),
        "write_files": (Value::from(write_files)),
        "runcmd": (Value::from(runcmd)),
    });

    // 9p mount entries for host directories shared via virtfs.
    if !ws.mounts.is_empty() {
        let mut mount_entries = VArray::new();
        for m in &ws.mounts {
            mount_entries.push(Value::from(VArray::from_iter([
                Value::from(m.tag.as_str()),
                Value::from(m.path.as_str()),
                Value::from("9p"),
                Value::from("trans=virtio,version=9p2000.L,nofail"),
                Value::from("0"),
                Value::from("0"),
            ])));
        }
        if let Some(obj) = config.as_object_mut() {
            obj.insert("mounts", Value::from(mount_entries));
        }
    }

    let yaml = facet_yaml::to_string(&config).expect("valid YAML serialization");
    // cloud-init expects #cloud-config on the first line; some versions
    // reject a document separator after it.
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    format!("#cloud-config\n{yaml}")
}
