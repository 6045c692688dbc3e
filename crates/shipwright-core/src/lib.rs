//! Core domain types and traits for the Shipwright pipeline.
//!
//! This crate contains:
//! - Resource identifiers
//! - The two-stage pipeline definition and the artifact handoff between stages
//! - The runtime dependency set and process configuration
//! - The image builder trait and build progress types
//! - Verification report types

pub mod builder;
pub mod error;
pub mod id;
pub mod pipeline;
pub mod process;
pub mod verify;

pub use error::{Error, Result};
pub use id::ResourceId;
