//! Host capability probing and admission control.
//!
//! Admission checks are free functions over a substitutable [`HostProbe`]
//! so they can be tested against fabricated memory/capability responses.

use std::path::Path;

use crate::error::HutchError;
use crate::workload::VmSpec;

/// Read-only view of the host's capacity and virtualization capabilities.
pub trait HostProbe: Send + Sync {
    /// Total and available memory in MiB, or `None` when the statistics
    /// cannot be obtained.
    fn memory_info(&self) -> Option<(u32, u32)>;

    /// Whether the host can run hypervisor-capable guests.
    fn supports_nested_vm(&self) -> bool;
}

/// Production probe backed by `/proc/meminfo` and the kvm module parameters.
pub struct ProcHost;

impl HostProbe for ProcHost {
    fn memory_info(&self) -> Option<(u32, u32)> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let total = parse_meminfo_kib(&meminfo, "MemTotal:")?;
        let available = parse_meminfo_kib(&meminfo, "MemAvailable:")?;
        Some(((total / 1024) as u32, (available / 1024) as u32))
    }

    fn supports_nested_vm(&self) -> bool {
        nested_param_enabled(Path::new("/sys/module/kvm_intel/parameters/nested"))
            || nested_param_enabled(Path::new("/sys/module/kvm_amd/parameters/nested"))
    }
}

fn parse_meminfo_kib(meminfo: &str, key: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with(key))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

fn nested_param_enabled(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|v| matches!(v.trim(), "Y" | "y" | "1"))
        .unwrap_or(false)
}

/// Gate a resource-hungry operation against host capacity.
///
/// Checks, in order: memory statistics must be obtainable, the requested
/// memory must fit in what is available, and nested virtualization must be
/// supported when the workload requires it. Read-only; runs before both
/// `create` and `start` boot a VM.
pub fn check_admission(
    spec: &VmSpec,
    needs_nested_vm: bool,
    host: &dyn HostProbe,
) -> Result<(), HutchError> {
    let Some((_total, available)) = host.memory_info() else {
        return Err(HutchError::ResourceQuery);
    };

    if spec.mem_mib > available {
        return Err(HutchError::ResourceLimit {
            requested: spec.mem_mib,
            available,
        });
    }

    if needs_nested_vm && !host.supports_nested_vm() {
        return Err(HutchError::Capability);
    }

    Ok(())
}
