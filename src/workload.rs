//! Workload definitions and per-instance state.
//!
//! A workload definition is a TOML file in `<data>/workloads/` describing a
//! base image and default VM parameters. Once an instance is created, the
//! merged result is persisted as `state.json` inside the instance directory
//! and restored for every later operation on that instance.

use std::path::Path;

use facet::Facet;

use crate::error::HutchError;
use crate::paths;

/// Filename of the persisted per-instance state document.
pub const STATE_FILE: &str = "state.json";

/// Documented fallbacks for zero-valued spec fields.
pub const DEFAULT_MEM_MIB: u32 = 2048;
pub const DEFAULT_CPUS: u32 = 2;
pub const DEFAULT_DISK_GIB: u32 = 16;

/// Built-in workload used when `<data>/workloads/default.toml` is absent.
const DEFAULT_WORKLOAD: &str = r#"
description = "Ubuntu 24.04 server cloud image"
base_image_url = "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img"

[vm]
mem_mib = 2048
cpus = 2
disk_gib = 16
"#;

/// A host directory exported to the guest over 9p.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct Mount {
    pub tag: String,
    pub path: String,
}

/// VM parameters. Zero-valued memory/CPU fields mean "use the documented
/// default", resolved by [`VmSpec::fill_defaults`] before any boot.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct VmSpec {
    #[facet(default)]
    pub mem_mib: u32,
    #[facet(default)]
    pub cpus: u32,
    #[facet(default)]
    pub disk_gib: u32,
    #[facet(default)]
    pub mounts: Vec<Mount>,
    /// Host port forwarded to guest port 22. Recorded only after a
    /// successful boot.
    #[facet(default)]
    pub ssh_port: Option<u16>,
}

impl VmSpec {
    /// Overlay caller-supplied overrides: non-zero scalars win, a non-empty
    /// mount list replaces the existing one. The SSH port is never taken
    /// from an override.
    pub fn merge_overrides(&mut self, custom: &VmSpec) {
        if custom.mem_mib != 0 {
            self.mem_mib = custom.mem_mib;
        }
        if custom.cpus != 0 {
            self.cpus = custom.cpus;
        }
        if custom.disk_gib != 0 {
            self.disk_gib = custom.disk_gib;
        }
        if !custom.mounts.is_empty() {
            self.mounts = custom.mounts.clone();
        }
    }

    /// Replace zero-valued fields with the documented defaults.
    pub fn fill_defaults(&mut self) {
        if self.mem_mib == 0 {
            self.mem_mib = DEFAULT_MEM_MIB;
        }
        if self.cpus == 0 {
            self.cpus = DEFAULT_CPUS;
        }
        if self.disk_gib == 0 {
            self.disk_gib = DEFAULT_DISK_GIB;
        }
    }
}

/// On-disk workload definition (TOML).
#[derive(Debug, Clone, Facet)]
pub struct WorkloadDefinition {
    #[facet(default)]
    pub description: String,
    pub base_image_url: String,
    /// Derived from the URL's final path segment when empty.
    #[facet(default)]
    pub base_image_name: String,
    #[facet(default)]
    pub needs_nested_vm: bool,
    #[facet(default)]
    pub vm: VmSpec,
}

/// Persisted per-instance document (JSON in the instance directory).
#[derive(Debug, Clone, Facet)]
pub struct InstanceState {
    pub workload_name: String,
    pub base_image_url: String,
    pub base_image_name: String,
    #[facet(default)]
    pub needs_nested_vm: bool,
    pub vm: VmSpec,
}

/// A resolved workload: the persisted document plus the rendered cloud-init
/// user-data (held in memory between rendering and ISO assembly).
#[derive(Debug, Clone)]
pub struct Workload {
    pub state: InstanceState,
    pub merged_user_data: String,
}

/// Load a workload definition by name from the workloads directory,
/// falling back to the built-in `default` workload.
pub fn create_workload(root: &Path, name: &str) -> Result<Workload, HutchError> {
    let path = paths::workloads_dir(root).join(format!("{name}.toml"));
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && name == "default" => {
            DEFAULT_WORKLOAD.to_string()
        }
        Err(e) => {
            return Err(HutchError::io(
                format!("reading workload definition {}", path.display()),
                e,
            ));
        }
    };

    let def: WorkloadDefinition =
        facet_toml::from_str(&contents).map_err(|e| HutchError::WorkloadParse {
            name: name.to_string(),
            message: e.to_string(),
        })?;

    if def.base_image_url.is_empty() {
        return Err(HutchError::WorkloadParse {
            name: name.to_string(),
            message: "base_image_url must not be empty".into(),
        });
    }

    let base_image_name = if def.base_image_name.is_empty() {
        def.base_image_url
            .rsplit('/')
            .next()
            .unwrap_or("image.img")
            .to_string()
    } else {
        def.base_image_name.clone()
    };

    let mut vm = def.vm.clone();
    if vm.disk_gib == 0 {
        vm.disk_gib = DEFAULT_DISK_GIB;
    }

    Ok(Workload {
        state: InstanceState {
            workload_name: name.to_string(),
            base_image_url: def.base_image_url,
            base_image_name,
            needs_nested_vm: def.needs_nested_vm,
            vm,
        },
        merged_user_data: String::new(),
    })
}

/// Restore the persisted workload for an existing instance.
pub fn restore_workload(instance_dir: &Path) -> Result<Workload, HutchError> {
    let path = instance_dir.join(STATE_FILE);
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        HutchError::io(format!("reading instance state {}", path.display()), e)
    })?;
    let state: InstanceState =
        facet_json::from_str(&contents).map_err(|e| HutchError::WorkloadParse {
            name: path.display().to_string(),
            message: e.to_string(),
        })?;
    Ok(Workload {
        state,
        merged_user_data: String::new(),
    })
}

impl Workload {
    /// Persist the state document into the instance directory.
    pub fn persist(&self, instance_dir: &Path) -> Result<(), HutchError> {
        let json = facet_json::to_string(&self.state).map_err(|e| HutchError::WorkloadParse {
            name: self.state.workload_name.clone(),
            message: e.to_string(),
        })?;
        let path = instance_dir.join(STATE_FILE);
        std::fs::write(&path, json).map_err(|e| {
            HutchError::io(format!("writing instance state {}", path.display()), e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overrides_nonzero_fields_win() {
        let mut spec = VmSpec {
            mem_mib: 1024,
            cpus: 1,
            disk_gib: 8,
            ..Default::default()
        };
        spec.merge_overrides(&VmSpec {
            mem_mib: 4096,
            cpus: 0,
            disk_gib: 0,
            ..Default::default()
        });
        assert_eq!(spec.mem_mib, 4096);
        assert_eq!(spec.cpus, 1);
        assert_eq!(spec.disk_gib, 8);
    }

    #[test]
    fn merge_overrides_replaces_mounts_only_when_nonempty() {
        let mut spec = VmSpec {
            mounts: vec![Mount {
                tag: "src".into(),
                path: "/home/dev/src".into(),
            }],
            ..Default::default()
        };
        spec.merge_overrides(&VmSpec::default());
        assert_eq!(spec.mounts.len(), 1);

        spec.merge_overrides(&VmSpec {
            mounts: vec![
                Mount {
                    tag: "a".into(),
                    path: "/a".into(),
                },
                Mount {
                    tag: "b".into(),
                    path: "/b".into(),
                },
            ],
            ..Default::default()
        });
        assert_eq!(spec.mounts.len(), 2);
    }

    #[test]
    fn fill_defaults_never_leaves_zero() {
        let mut spec = VmSpec::default();
        spec.fill_defaults();
        assert_eq!(spec.mem_mib, DEFAULT_MEM_MIB);
        assert_eq!(spec.cpus, DEFAULT_CPUS);
        assert_eq!(spec.disk_gib, DEFAULT_DISK_GIB);
    }

    #[test]
    fn builtin_default_workload_parses() {
        let dir = tempfile::tempdir().unwrap();
        let wkld = create_workload(dir.path(), "default").unwrap();
        assert_eq!(wkld.state.workload_name, "default");
        assert_eq!(wkld.state.base_image_name, "noble-server-cloudimg-amd64.img");
        assert!(!wkld.state.needs_nested_vm);
        assert_eq!(wkld.state.vm.mem_mib, 2048);
    }

    #[test]
    fn workload_file_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let wdir = paths::workloads_dir(dir.path());
        std::fs::create_dir_all(&wdir).unwrap();
        std::fs::write(
            wdir.join("kvm-dev.toml"),
            r#"
description = "nested KVM development"
base_image_url = "https://example.com/images/dev.qcow2"
needs_nested_vm = true

[vm]
mem_mib = 8192
cpus = 4
"#,
        )
        .unwrap();

        let wkld = create_workload(dir.path(), "kvm-dev").unwrap();
        assert!(wkld.state.needs_nested_vm);
        assert_eq!(wkld.state.vm.mem_mib, 8192);
        assert_eq!(wkld.state.base_image_name, "dev.qcow2");
        // disk was unset in the definition, so the parse-time default applies
        assert_eq!(wkld.state.vm.disk_gib, DEFAULT_DISK_GIB);
    }

    #[test]
    fn unknown_workload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(create_workload(dir.path(), "nope").is_err());
    }

    #[test]
    fn persist_then_restore_keeps_ssh_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut wkld = create_workload(dir.path(), "default").unwrap();
        wkld.state.vm.ssh_port = Some(10022);
        wkld.persist(dir.path()).unwrap();

        let restored = restore_workload(dir.path()).unwrap();
        assert_eq!(restored.state.vm.ssh_port, Some(10022));
        assert_eq!(restored.state.workload_name, "default");
    }

    #[test]
    fn restore_without_state_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(restore_workload(dir.path()).is_err());
    }
}
