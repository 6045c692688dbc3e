//! Image builder trait and build types.
//!
//! Builders turn a rendered multi-stage build definition plus a packed
//! context into images, and run short-lived probe containers against them.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ResourceId, Result};

/// Specification for one image build.
#[derive(Debug, Clone)]
pub struct ImageBuildSpec {
    /// Run this build belongs to.
    pub run_id: ResourceId,
    /// Path of the build definition inside the context.
    pub dockerfile: String,
    /// Packed build context (tar).
    pub context: Bytes,
    /// Stop after this stage. `None` builds the final stage.
    pub target: Option<String>,
    /// Reference to give the resulting image.
    pub tag: String,
    /// Labels to set on the resulting image.
    pub labels: HashMap<String, String>,
}

/// Progress reported while an image builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BuildProgress {
    /// A build step started.
    Step {
        index: u32,
        total: u32,
        instruction: String,
    },
    /// Output from the current step.
    Log(LogLine),
    /// The build failed. No image was produced.
    Error { message: String },
    /// The build finished.
    Built { image_id: String },
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// What the builder knows about a local image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    /// Size in bytes.
    pub size: u64,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// A short-lived container run against an image.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub image: String,
    /// Replaces the image's entry point.
    pub entrypoint: Vec<String>,
    /// Added on top of the image's environment.
    pub env: HashMap<String, String>,
}

impl ProbeSpec {
    /// Probe running a `/bin/sh -c` script.
    pub fn shell(image: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            entrypoint: vec!["/bin/sh".to_string(), "-c".to_string(), script.into()],
            env: HashMap::new(),
        }
    }
}

/// Result of a probe container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutput {
    pub exit_code: i64,
    pub stdout: String,
}

impl ProbeOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for image build backends.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Name of this builder.
    fn name(&self) -> &'static str;

    /// Check the backend is reachable.
    async fn available(&self) -> bool;

    /// Start a build and stream its progress. A successful build yields a
    /// [`BuildProgress::Built`] item, a failed one a [`BuildProgress::Error`].
    async fn build(&self, spec: ImageBuildSpec) -> Result<BoxStream<'static, BuildProgress>>;

    /// Inspect a local image.
    async fn inspect(&self, reference: &str) -> Result<ImageInfo>;

    /// Run a probe container to completion and collect its output.
    async fn probe(&self, spec: ProbeSpec) -> Result<ProbeOutput>;

    /// Add a reference to an existing image.
    async fn tag(&self, image: &str, reference: &str) -> Result<()>;

    /// Push a reference to its registry.
    async fn push(&self, reference: &str) -> Result<()>;

    /// Remove a local image reference.
    async fn remove(&self, reference: &str) -> Result<()>;
}
