use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::config::ConfigError;
use crate::executor::ExecutorError;
use crate::media::MediaError;
use crate::provider::InferenceError;

/// Top-level error type for the retouch-core library.
#[derive(Debug, Error)]
pub enum RetouchError {
    /// Configuration parse, validation, or credential error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A capability provider failed to produce a usable response.
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// The external tool could not be located or invoked.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Audit trail read/write error.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Source image validation error.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, RetouchError>;
