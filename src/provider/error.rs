// Error types shared by all sandbox backends.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Backend prerequisites are not satisfied yet (e.g. VM artifacts still
    /// downloading). Callers should retry later rather than block.
    #[error("sandbox backend not ready: {0}")]
    NotReady(String),

    #[error("no sandbox found for session {0}")]
    NotFound(String),

    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    #[error("sandbox operation failed: {0}")]
    OperationFailed(String),

    #[error("exec failed: {0}")]
    ExecFailed(String),

    #[error("operation timed out")]
    Timeout,

    /// Uniform answer from a backend the current platform cannot provide.
    #[error("virtual machine backend is not available on this platform")]
    Unsupported,

    #[error("secret {0} is not set in the sandbox")]
    SecretNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

pub type Result<T> = std::result::Result<T, ProviderError>;
