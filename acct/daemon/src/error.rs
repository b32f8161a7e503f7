//! Error taxonomy of the accounting probe runtime

use thiserror::Error;

/// Boxed source error from the eBPF layer
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by probe construction, lifecycle and registration
#[derive(Debug, Error)]
pub enum Error {
    /// Binary record has the wrong length
    #[error("input byte array incorrect length {len}, expected {expected}")]
    MalformedInput { len: usize, expected: usize },

    /// No program build exists for the running kernel
    #[error("kernel release '{release}' is not supported: {reason}")]
    KernelUnsupported { release: String, reason: String },

    /// A probe target is missing from the kernel symbol table
    #[error("kernel symbol '{symbol}' not found, required by {probe}")]
    SymbolMissing { symbol: String, probe: String },

    /// The program object could not be read or loaded into the kernel
    #[error("failed to load BPF program for kernel {version}: {source}")]
    LoadFailed {
        version: String,
        #[source]
        source: BoxError,
    },

    /// Probe configuration failed validation
    #[error("invalid probe configuration: {0}")]
    InvalidConfig(String),

    /// Attaching a program to its kernel hook failed
    #[error("failed to attach {program}: {source}")]
    Attach {
        program: String,
        #[source]
        source: BoxError,
    },

    /// A required map is missing or could not be used
    #[error("map {name}: {source}")]
    Map {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("probe already started")]
    AlreadyStarted,

    #[error("probe not started")]
    NotStarted,

    #[error("probe has been stopped")]
    Stopped,

    #[error("sink '{0}' is not initialized")]
    SinkNotInitialized(String),

    #[error("consumer '{0}' already registered")]
    ConsumerExists(String),

    #[error("consumer '{0}' not registered")]
    ConsumerNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn map(name: &str, source: impl Into<BoxError>) -> Self {
        Error::Map {
            name: name.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn attach(program: &str, source: impl Into<BoxError>) -> Self {
        Error::Attach {
            program: program.to_string(),
            source: source.into(),
        }
    }
}
