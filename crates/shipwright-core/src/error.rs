//! Error types for Shipwright.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("toolchain unavailable: {image}: {message}")]
    ToolchainUnavailable { image: String, message: String },

    #[error("compile error: {0}")]
    CompileError(String),

    #[error("base image unavailable: {image}: {message}")]
    BaseImageUnavailable { image: String, message: String },

    #[error("failed to install runtime dependencies [{}]: {message}", packages.join(", "))]
    DependencyInstallError {
        packages: Vec<String>,
        message: String,
    },

    #[error("artifact path mismatch: expected {expected}: {message}")]
    ArtifactPathMismatch { expected: String, message: String },

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
