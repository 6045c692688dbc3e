//! CLI command implementations.

pub mod build;
pub mod verify;

use anyhow::{Context, Result};
use shipwright_config::{check_artifact, load_pipeline};
use shipwright_core::pipeline::ReleasePipeline;
use shipwright_executor::{DockerImageBuilder, ImageBuilder, render_dockerignore};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Load and validate a pipeline definition.
pub fn load(path: &Path) -> Result<ReleasePipeline> {
    load_pipeline(path)
        .with_context(|| format!("Failed to load pipeline definition: {}", path.display()))
}

/// Registry credentials used for pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryLogin {
    pub username: String,
    pub password: String,
}

impl RegistryLogin {
    /// A username without a password (or the reverse) is an error, neither
    /// means anonymous pushes.
    pub fn from_args(username: Option<String>, password: Option<String>) -> Result<Option<Self>> {
        match (username, password) {
            (Some(username), Some(password)) => Ok(Some(Self { username, password })),
            (None, None) => Ok(None),
            (Some(_), None) => {
                anyhow::bail!("--registry-username needs SHIPWRIGHT_REGISTRY_PASSWORD to be set")
            }
            (None, Some(_)) => anyhow::bail!("a registry password was given without a username"),
        }
    }
}

/// Connect to Docker and make sure the daemon answers.
pub async fn connect(
    docker_host: Option<&str>,
    login: Option<RegistryLogin>,
) -> Result<Arc<dyn ImageBuilder>> {
    let mut builder = match docker_host {
        Some(host) => DockerImageBuilder::connect(host),
        None => DockerImageBuilder::new(),
    }
    .context("Failed to connect to Docker")?;
    if let Some(login) = login {
        info!(username = %login.username, "Using registry credentials");
        builder = builder.with_credentials(login.username, login.password);
    }

    if !builder.available().await {
        anyhow::bail!(
            "Docker daemon is not reachable at {}",
            docker_host.unwrap_or("the default socket")
        );
    }
    info!(builder = builder.name(), "Connected to image builder");
    Ok(Arc::new(builder))
}

pub fn validate(path: &Path, source: Option<&Path>) -> Result<()> {
    let pipeline = load(path)?;

    let source_dir = source.unwrap_or(pipeline.build.source.path.as_path());
    if source.is_some() || source_dir.join("Cargo.toml").is_file() {
        check_artifact(&pipeline, source_dir).with_context(|| {
            format!("Artifact check against {} failed", source_dir.display())
        })?;
    } else {
        println!(
            "No Cargo.toml in {}, artifact name not checked",
            source_dir.display()
        );
    }

    let handoff = pipeline.handoff();
    println!("Configuration is valid");
    println!("  pipeline:  {}", pipeline.name);
    println!("  toolchain: {}", pipeline.build.toolchain.reference());
    println!("  base:      {}", pipeline.release.base.reference());
    println!(
        "  artifact:  {} -> {}",
        handoff.source_path, handoff.destination_path
    );
    println!(
        "  runtime:   {}",
        pipeline.release.dependencies.packages().join(", ")
    );
    Ok(())
}

pub fn render(path: &Path, dockerignore: bool) -> Result<()> {
    let pipeline = load(path)?;
    if dockerignore {
        print!("{}", render_dockerignore(&pipeline));
    } else {
        print!("{}", shipwright_executor::render(&pipeline).dockerfile);
    }
    Ok(())
}

pub fn env(path: &Path) -> Result<()> {
    let pipeline = load(path)?;
    for (key, value) in pipeline.release.process.to_env() {
        println!("{}={}", key, value);
    }
    Ok(())
}
