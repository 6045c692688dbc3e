//! KDL configuration parsing for Shipwright.
//!
//! This crate handles:
//! - Pipeline definitions (shipwright.kdl)
//! - Definition-time validation of the stage handoff
//! - Checking the artifact name against the service's Cargo manifest
//! - Variable interpolation for tags and labels

pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod validate;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use manifest::{binary_names, check_artifact};
pub use pipeline::{load_pipeline, parse_pipeline};
pub use validate::validate_pipeline;
pub use variables::{GitContext, PipelineContext, VariableContext, VariableContextBuilder};
