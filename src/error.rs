use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("out of pool memory")]
    OutOfMemory,
    #[error("invalid signature bundle: {0}")]
    InvalidSignature(&'static str),
    #[error("no signature bundle loaded")]
    NoSignature,
    #[error("unknown subscription key: {0}")]
    UnknownKey(String),
    #[error("subscription registry busy")]
    Busy,
    #[error("plugin resolve failed for {0}")]
    PluginResolve(String),
    #[error("report config {0} not present")]
    MissingReportConfig(String),
    #[error("gatekeeper transport: {0}")]
    Transport(String),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FlowError {
    /// Soft errors leave the subsystem in a retryable state; the scheduler
    /// logs them and continues rather than tearing the collector down.
    pub fn is_soft(&self) -> bool {
        matches!(self, FlowError::MissingReportConfig(_))
    }
}
