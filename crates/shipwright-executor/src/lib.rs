//! Image build backend for Shipwright.
//!
//! Provides:
//! - Rendering a pipeline into a multi-stage Dockerfile
//! - Packing the source tree into a build context
//! - A Docker implementation of the image builder

pub mod context;
pub mod docker;
pub mod dockerfile;

pub use context::{BuildContext, pack_context};
pub use docker::DockerImageBuilder;
pub use dockerfile::{DOCKERFILE_NAME, RenderedBuild, RenderedStep, render, render_dockerignore};
pub use shipwright_core::builder::{
    BuildProgress, ImageBuildSpec, ImageBuilder, ImageInfo, LogLine, LogStream, ProbeOutput,
    ProbeSpec,
};
