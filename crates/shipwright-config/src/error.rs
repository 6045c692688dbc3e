//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("artifact '{artifact}' is not built by the source tree (binaries: {})", available.join(", "))]
    ArtifactMismatch {
        artifact: String,
        available: Vec<String>,
    },

    #[error("invalid Cargo manifest {path}: {source}")]
    Manifest {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for shipwright_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ArtifactMismatch { ref artifact, .. } => {
                shipwright_core::Error::ArtifactPathMismatch {
                    expected: artifact.clone(),
                    message: err.to_string(),
                }
            }
            other => shipwright_core::Error::InvalidInput(other.to_string()),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
