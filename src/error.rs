use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HutchError {
    #[error("unable to read memory statistics of the host")]
    ResourceQuery,

    #[error("requested {requested} MiB of RAM but only {available} MiB is available")]
    ResourceLimit { requested: u32, available: u32 },

    #[error("workload requires nested virtualization but the host does not support it")]
    #[diagnostic(help("enable the `nested` parameter of the kvm_intel/kvm_amd module"))]
    Capability,

    #[error("instance '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("instance '{name}' does not exist")]
    NotFound { name: String },

    #[error("instance '{name}' has no SSH port recorded; it never completed a boot")]
    State { name: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image download failed: {message}")]
    Transport {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("failed to parse workload '{name}': {message}")]
    WorkloadParse { name: String, message: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl HutchError {
    /// Wrap an io::Error with a human-readable context line.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HutchError::Io {
            context: context.into(),
            source,
        }
    }
}
