//! The two-stage pipeline definition.
//!
//! A [`ReleasePipeline`] is a Build Stage followed by a Release Stage. The
//! artifact name is declared once on the pipeline and both the path the Build
//! Stage writes and the path the Release Stage copies to are derived from it
//! through [`ReleasePipeline::handoff`].

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::Error;
use crate::process::ProcessConfig;

/// Stage name of the toolchain environment in the rendered build.
pub const BUILD_STAGE_NAME: &str = "builder";

/// Stage name of the runtime environment in the rendered build.
pub const RELEASE_STAGE_NAME: &str = "release";

/// Packages installed into the runtime environment when none are declared.
pub const DEFAULT_RUNTIME_PACKAGES: [&str; 3] = ["libpq-dev", "ca-certificates", "libssl-dev"];

/// A complete build-and-release pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasePipeline {
    /// Pipeline name (e.g., "scoreboard").
    pub name: String,
    /// Name of the single executable the Build Stage produces.
    pub artifact: String,
    /// Toolchain environment and compilation.
    pub build: BuildStage,
    /// Minimal runtime environment.
    pub release: ReleaseStage,
    /// Tags, labels and push policy for the finished image.
    pub publish: PublishSpec,
}

/// A versioned compiler image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    /// Image name (e.g., "rust").
    pub image: String,
    /// Channel or version tag (e.g., "1.85").
    pub channel: String,
}

impl Toolchain {
    /// Full image reference, `image:channel`.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.channel)
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            image: "rust".to_string(),
            channel: "1.85".to_string(),
        }
    }
}

/// The source directory staged into the toolchain environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTree {
    /// Directory on the host, relative paths resolve against the definition file.
    pub path: PathBuf,
    /// Paths relative to `path` left out of the staged copy. Empty means the
    /// tree is copied in full.
    pub exclude: Vec<String>,
}

impl Default for SourceTree {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            exclude: Vec::new(),
        }
    }
}

impl SourceTree {
    /// Exclusions as plain relative paths: leading `./` and trailing `/`
    /// dropped.
    pub fn exclusions(&self) -> Vec<String> {
        self.exclude
            .iter()
            .map(|p| {
                let mut p = p.as_str();
                while let Some(rest) = p.strip_prefix("./") {
                    p = rest.trim_start_matches('/');
                }
                p.trim_end_matches('/').to_string()
            })
            .collect()
    }
}

/// The Build Stage: toolchain, staged source and compile invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStage {
    pub toolchain: Toolchain,
    /// Working directory inside the toolchain environment.
    pub workdir: String,
    pub source: SourceTree,
    /// Cargo profile, must be an optimized one.
    pub profile: String,
    /// Pass `--locked` so the lockfile is honored as-is.
    pub locked: bool,
    /// Cargo features to enable.
    pub features: Vec<String>,
}

impl BuildStage {
    /// Directory under `target/` that cargo writes the profile's output to.
    pub fn profile_dir(&self) -> &str {
        match self.profile.as_str() {
            "dev" | "test" => "debug",
            "bench" => "release",
            other => other,
        }
    }

    /// Whether the profile produces an optimized artifact.
    pub fn is_optimized(&self) -> bool {
        self.profile_dir() != "debug"
    }

    /// The compile invocation, as an argv.
    pub fn compile_command(&self) -> Vec<String> {
        let mut cmd = vec!["cargo".to_string(), "build".to_string()];
        if self.profile == "release" {
            cmd.push("--release".to_string());
        } else {
            cmd.push("--profile".to_string());
            cmd.push(self.profile.clone());
        }
        if self.locked {
            cmd.push("--locked".to_string());
        }
        if !self.features.is_empty() {
            cmd.push("--features".to_string());
            cmd.push(self.features.join(","));
        }
        cmd
    }
}

impl Default for BuildStage {
    fn default() -> Self {
        Self {
            toolchain: Toolchain::default(),
            workdir: "/usr/src/app".to_string(),
            source: SourceTree::default(),
            profile: "release".to_string(),
            locked: false,
            features: Vec::new(),
        }
    }
}

/// A minimal base image for the runtime environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeBase {
    /// Image name (e.g., "debian").
    pub image: String,
    /// Release label (e.g., "bookworm-slim").
    pub release: String,
}

impl RuntimeBase {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.release)
    }
}

impl Default for RuntimeBase {
    fn default() -> Self {
        Self {
            image: "debian".to_string(),
            release: "bookworm-slim".to_string(),
        }
    }
}

/// The explicit list of packages the artifact needs at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDependencySet(Vec<String>);

impl RuntimeDependencySet {
    pub fn new(packages: Vec<String>) -> Self {
        Self(packages)
    }

    pub fn packages(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, package: &str) -> bool {
        self.0.iter().any(|p| p == package)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Default for RuntimeDependencySet {
    fn default() -> Self {
        Self(
            DEFAULT_RUNTIME_PACKAGES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        )
    }
}

/// The Release Stage: base image, runtime packages, artifact destination and
/// process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseStage {
    pub base: RuntimeBase,
    pub dependencies: RuntimeDependencySet,
    /// Directory the artifact is copied into.
    pub destination: String,
    pub process: ProcessConfig,
}

impl Default for ReleaseStage {
    fn default() -> Self {
        Self {
            base: RuntimeBase::default(),
            dependencies: RuntimeDependencySet::default(),
            destination: "/usr/local/bin".to_string(),
            process: ProcessConfig::default(),
        }
    }
}

/// What happens to the image once it is built and verified.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishSpec {
    /// Image references to tag, may contain `${...}` variables.
    pub tags: Vec<String>,
    /// Image labels, values may contain `${...}` variables.
    pub labels: BTreeMap<String, String>,
    /// Push every tag to its registry.
    pub push: bool,
}

/// The checked cross-stage reference: where the artifact is written and
/// where it lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandoff {
    pub name: String,
    /// Path inside the toolchain environment.
    pub source_path: String,
    /// Path inside the runtime environment.
    pub destination_path: String,
}

impl ReleasePipeline {
    /// Derive both ends of the artifact handoff from the single declared name.
    pub fn handoff(&self) -> ArtifactHandoff {
        let workdir = self.build.workdir.trim_end_matches('/');
        let destination = self.release.destination.trim_end_matches('/');
        ArtifactHandoff {
            name: self.artifact.clone(),
            source_path: format!(
                "{}/target/{}/{}",
                workdir,
                self.build.profile_dir(),
                self.artifact
            ),
            destination_path: format!("{}/{}", destination, self.artifact),
        }
    }

    /// Map a failure reported by a build step to the error taxonomy.
    pub fn classify_failure(&self, operation: PipelineOperation, message: String) -> Error {
        match operation {
            PipelineOperation::ProvisionToolchain => Error::ToolchainUnavailable {
                image: self.build.toolchain.reference(),
                message,
            },
            PipelineOperation::StageSource | PipelineOperation::Compile => {
                Error::CompileError(message)
            }
            PipelineOperation::ProvisionBase => Error::BaseImageUnavailable {
                image: self.release.base.reference(),
                message,
            },
            PipelineOperation::InstallDependencies => Error::DependencyInstallError {
                packages: self.release.dependencies.packages().to_vec(),
                message,
            },
            PipelineOperation::CopyArtifact => Error::ArtifactPathMismatch {
                expected: self.handoff().source_path,
                message,
            },
            PipelineOperation::Configure | PipelineOperation::DeclareEntrypoint => {
                Error::ExecutionFailed(message)
            }
        }
    }
}

/// The two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum StageKind {
    #[display("build")]
    Build,
    #[display("release")]
    Release,
}

/// A single operation of a stage, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum PipelineOperation {
    #[display("provision toolchain")]
    ProvisionToolchain,
    #[display("stage source")]
    StageSource,
    #[display("compile")]
    Compile,
    #[display("provision base")]
    ProvisionBase,
    #[display("install runtime dependencies")]
    InstallDependencies,
    #[display("copy artifact")]
    CopyArtifact,
    #[display("configure")]
    Configure,
    #[display("declare entry point")]
    DeclareEntrypoint,
}

impl PipelineOperation {
    pub fn stage(&self) -> StageKind {
        match self {
            PipelineOperation::ProvisionToolchain
            | PipelineOperation::StageSource
            | PipelineOperation::Compile => StageKind::Build,
            _ => StageKind::Release,
        }
    }
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub status: StageStatus,
    /// Image produced by the stage, if any.
    pub image_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Status of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    /// Not started yet.
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed.
    Failed { message: String },
    /// Never started because an earlier stage failed.
    Skipped { reason: String },
}

impl StageStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Succeeded)
    }
}
