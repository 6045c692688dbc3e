//! Docker image builder implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{
    BuildImageOptions, CreateImageOptions, PushImageOptions, RemoveImageOptions, TagImageOptions,
};
use bollard::models::BuildInfo;
use futures::StreamExt;
use futures::stream::BoxStream;
use regex::Regex;
use shipwright_core::ResourceId;
use shipwright_core::builder::*;
use shipwright_core::{Error, Result};
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

// Classic builder step header, e.g. "Step 3/10 : RUN cargo build --release".
static STEP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Step (\d+)/(\d+) : (.+)$").unwrap());

static BUILT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Successfully built ([0-9a-f]+)$").unwrap());

/// Seconds to wait on the daemon for a single request.
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Builds images against a Docker daemon.
pub struct DockerImageBuilder {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerImageBuilder {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Connect to the daemon at `host` (`unix://`, `tcp://` or `http://`).
    pub fn connect(host: &str) -> Result<Self> {
        let connected = if let Some(path) = host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        } else {
            return Err(Error::InvalidInput(format!(
                "unsupported Docker host: {}",
                host
            )));
        };
        let docker = connected.map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            credentials: None,
        }
    }

    /// Registry credentials used when pushing.
    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some(DockerCredentials {
            username: Some(username),
            password: Some(password),
            ..Default::default()
        });
        self
    }

    fn probe_container_name() -> String {
        format!("shipwright-probe-{}", ResourceId::new().short())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(Error::NotFound(format!("failed to pull {}: {}", image, e)));
                }
            }
        }
        Ok(())
    }

    async fn collect_stdout(&self, container: &str) -> String {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: false,
            ..Default::default()
        };

        let mut stream = self.docker.logs(container, Some(options));
        let mut stdout = String::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, container = %container, "Log stream error");
                    break;
                }
            }
        }
        stdout
    }

    async fn remove_container(&self, container: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(container, Some(options)).await {
            warn!(error = %e, container = %container, "Failed to remove probe container");
        }
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn build(&self, spec: ImageBuildSpec) -> Result<BoxStream<'static, BuildProgress>> {
        let options = BuildImageOptions {
            dockerfile: spec.dockerfile.clone(),
            t: spec.tag.clone(),
            target: spec.target.clone().unwrap_or_default(),
            labels: spec.labels.clone(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        info!(
            run = %spec.run_id,
            tag = %spec.tag,
            target = spec.target.as_deref().unwrap_or("final"),
            context_bytes = spec.context.len(),
            "Starting image build"
        );

        // The daemon stream borrows the client, so it is drained on its own
        // task holding a clone.
        let docker = self.docker.clone();
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            let mut stream = Box::pin(docker.build_image(options, None, Some(spec.context)));
            while let Some(result) = stream.next().await {
                for item in progress_from(result) {
                    if tx.send(item).await.is_err() {
                        debug!("Build progress receiver dropped");
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn inspect(&self, reference: &str) -> Result<ImageInfo> {
        let inspect = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(|e| Error::NotFound(format!("image {}: {}", reference, e)))?;

        let config = inspect.config.unwrap_or_default();
        Ok(ImageInfo {
            id: inspect.id.unwrap_or_default(),
            size: inspect.size.map(|s| s.max(0) as u64).unwrap_or_default(),
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
        })
    }

    async fn probe(&self, spec: ProbeSpec) -> Result<ProbeOutput> {
        self.ensure_image(&spec.image).await?;

        let container_name = Self::probe_container_name();
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: Some(spec.entrypoint.clone()),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        debug!(container = %container_name, image = %spec.image, "Creating probe container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_container(&container_name).await;
            return Err(Error::ExecutionFailed(format!(
                "Failed to start container: {}",
                e
            )));
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self.docker.wait_container(&container_name, Some(options));
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // Non-zero exits surface as a wait error carrying the code.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                self.remove_container(&container_name).await;
                return Err(Error::ExecutionFailed(format!(
                    "Failed to wait for container: {}",
                    e
                )));
            }
            None => -1,
        };

        let stdout = self.collect_stdout(&container_name).await;
        self.remove_container(&container_name).await;

        Ok(ProbeOutput { exit_code, stdout })
    }

    async fn tag(&self, image: &str, reference: &str) -> Result<()> {
        let (repo, tag) = split_reference(reference);
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        self.docker
            .tag_image(image, Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to tag {}: {}", reference, e)))
    }

    async fn push(&self, reference: &str) -> Result<()> {
        let (repo, tag) = split_reference(reference);
        let options = PushImageOptions {
            tag: tag.to_string(),
        };

        info!(reference = %reference, "Pushing image");
        let mut stream = self
            .docker
            .push_image(repo, Some(options), self.credentials.clone());
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(Error::ExecutionFailed(format!(
                            "Failed to push {}: {}",
                            reference, error
                        )));
                    }
                    if let Some(status) = info.status {
                        debug!(status = %status, "Push progress");
                    }
                }
                Err(e) => {
                    return Err(Error::ExecutionFailed(format!(
                        "Failed to push {}: {}",
                        reference, e
                    )));
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            noprune: false,
        };
        self.docker
            .remove_image(reference, Some(options), None)
            .await
            .map(|_| ())
            .map_err(|e| Error::ExecutionFailed(format!("Failed to remove {}: {}", reference, e)))
    }
}

/// Translate one daemon build message into progress items.
fn progress_from(result: std::result::Result<BuildInfo, DockerError>) -> Vec<BuildProgress> {
    let info = match result {
        Ok(info) => info,
        Err(e) => {
            return vec![BuildProgress::Error {
                message: e.to_string(),
            }];
        }
    };

    let mut items = Vec::new();

    if let Some(stream) = info.stream {
        for line in stream.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            items.push(parse_stream_line(line));
        }
    }

    if let Some(status) = info.status {
        items.push(BuildProgress::Log(LogLine::new(LogStream::System, status)));
    }

    if let Some(id) = info.aux.and_then(|aux| aux.id) {
        items.push(BuildProgress::Built { image_id: id });
    }

    if let Some(error) = info.error {
        let message = info
            .error_detail
            .and_then(|d| d.message)
            .unwrap_or(error);
        items.push(BuildProgress::Error { message });
    }

    items
}

fn parse_stream_line(line: &str) -> BuildProgress {
    if let Some(caps) = STEP_REGEX.captures(line) {
        let index = caps[1].parse().unwrap_or_default();
        let total = caps[2].parse().unwrap_or_default();
        return BuildProgress::Step {
            index,
            total,
            instruction: caps[3].to_string(),
        };
    }
    if let Some(caps) = BUILT_REGEX.captures(line) {
        return BuildProgress::Built {
            image_id: caps[1].to_string(),
        };
    }
    BuildProgress::Log(LogLine::new(LogStream::Stdout, line))
}

/// Split `registry:5000/name:tag` into repository and tag. A missing tag
/// means `latest`.
fn split_reference(reference: &str) -> (&str, &str) {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => (
            &reference[..name_start + i],
            &reference[name_start + i + 1..],
        ),
        None => (reference, "latest"),
    }
}
