use std::path::PathBuf;

/// Data root: `$HUTCH_DATA_DIR` or `~/.local/share/hutch/`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HUTCH_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("hutch")
}

/// Base image cache: `$HUTCH_CACHE_DIR` or `~/.cache/hutch/images/`.
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HUTCH_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("hutch")
        .join("images")
}

/// Workload definition directory under a data root.
pub fn workloads_dir(root: &std::path::Path) -> PathBuf {
    root.join("workloads")
}

/// Per-instance directory under a data root. Its existence is the sole
/// marker that the instance exists.
pub fn instance_dir(root: &std::path::Path, name: &str) -> PathBuf {
    root.join("instances").join(name)
}
