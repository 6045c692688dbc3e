//! Pipeline orchestrator - runs the Build Stage, then the Release Stage, then
//! verification and publishing.

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use shipwright_config::{VariableContext, check_artifact, validate_pipeline};
use shipwright_core::builder::{BuildProgress, ImageBuildSpec, ImageBuilder, LogLine};
use shipwright_core::pipeline::{
    BUILD_STAGE_NAME, PipelineOperation, ReleasePipeline, StageKind, StageResult, StageStatus,
};
use shipwright_core::verify::VerificationReport;
use shipwright_core::{Error, ResourceId, Result};
use shipwright_executor::{DOCKERFILE_NAME, RenderedBuild, pack_context, render};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::publish::{PublishPlan, RUN_LABEL, RunRefs, plan_publish};
use crate::verify::Verifier;

/// Event emitted during pipeline execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        stage: StageKind,
    },
    StepStarted {
        stage: StageKind,
        index: u32,
        total: u32,
        operation: Option<PipelineOperation>,
        instruction: String,
    },
    StageLog {
        stage: StageKind,
        line: LogLine,
    },
    StageCompleted {
        stage: StageKind,
        success: bool,
    },
    VerificationCompleted {
        report: VerificationReport,
    },
    Published {
        reference: String,
        pushed: bool,
    },
    PipelineCompleted {
        success: bool,
    },
}

/// Result of a pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: ResourceId,
    pub success: bool,
    pub stages: Vec<StageResult>,
    /// Digest of the packed source tree.
    pub source_digest: Option<String>,
    /// Id of the release image, once it was built.
    pub image_id: Option<String>,
    /// References the image was published under.
    pub tags: Vec<String>,
    pub report: Option<VerificationReport>,
    pub error: Option<String>,
}

impl PipelineResult {
    fn new(run_id: ResourceId) -> Self {
        Self {
            run_id,
            success: false,
            stages: [StageKind::Build, StageKind::Release]
                .into_iter()
                .map(|stage| StageResult {
                    stage,
                    status: StageStatus::Pending,
                    image_id: None,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            source_digest: None,
            image_id: None,
            tags: Vec::new(),
            report: None,
            error: None,
        }
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == kind)
    }

    fn stage_mut(&mut self, kind: StageKind) -> &mut StageResult {
        let index = match kind {
            StageKind::Build => 0,
            StageKind::Release => 1,
        };
        &mut self.stages[index]
    }

    fn skip_pending(&mut self, reason: &str) {
        for stage in &mut self.stages {
            if stage.status == StageStatus::Pending {
                stage.status = StageStatus::Skipped {
                    reason: reason.to_string(),
                };
            }
        }
    }
}

/// How a run treats verification, publishing and the builder image.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Run the verification probes before publishing.
    pub verify: bool,
    /// Push every tag even if the pipeline does not ask for it.
    pub push: bool,
    /// Leave the Build Stage image in place after the run.
    pub keep_builder: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            verify: true,
            push: false,
            keep_builder: false,
        }
    }
}

/// Orchestrates the execution of a pipeline.
pub struct PipelineOrchestrator {
    builder: Arc<dyn ImageBuilder>,
    options: RunOptions,
}

impl PipelineOrchestrator {
    pub fn new(builder: Arc<dyn ImageBuilder>) -> Self {
        Self {
            builder,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(builder: Arc<dyn ImageBuilder>, options: RunOptions) -> Self {
        Self { builder, options }
    }

    /// Execute a pipeline, returning a channel of events and a handle to get the final result.
    ///
    /// `var_ctx` supplies the git and environment variables for tags and
    /// labels. The run id, pipeline and source digest are filled in here.
    pub fn execute(
        &self,
        pipeline: &ReleasePipeline,
        var_ctx: VariableContext,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let run = Run {
            builder: self.builder.clone(),
            options: self.options.clone(),
            pipeline: pipeline.clone(),
            run_id: ResourceId::new(),
            var_ctx,
            tx,
        };

        let handle = tokio::spawn(async move { run.execute().await });

        (rx, handle)
    }
}

/// State of one pipeline run.
struct Run {
    builder: Arc<dyn ImageBuilder>,
    options: RunOptions,
    pipeline: ReleasePipeline,
    run_id: ResourceId,
    var_ctx: VariableContext,
    tx: mpsc::Sender<PipelineEvent>,
}

impl Run {
    async fn execute(mut self) -> PipelineResult {
        let mut result = PipelineResult::new(self.run_id);
        let refs = RunRefs::new(&self.pipeline, &self.run_id);

        info!(
            run = %self.run_id,
            pipeline = %self.pipeline.name,
            artifact = %self.pipeline.artifact,
            "Starting pipeline run"
        );

        if let Err(e) = self.run(&refs, &mut result).await {
            error!(run = %self.run_id, error = %e, "Pipeline run failed");
            result.error = Some(e.to_string());
            result.skip_pending("an earlier step failed");
        }

        let built = result
            .stage(StageKind::Build)
            .is_some_and(|s| s.image_id.is_some());
        if built && !self.options.keep_builder {
            if let Err(e) = self.builder.remove(&refs.builder).await {
                warn!(image = %refs.builder, error = %e, "Failed to remove builder image");
            }
        }

        result.success = result.error.is_none();
        self.send(PipelineEvent::PipelineCompleted {
            success: result.success,
        })
        .await;

        result
    }

    async fn run(&mut self, refs: &RunRefs, result: &mut PipelineResult) -> Result<()> {
        validate_pipeline(&self.pipeline)?;
        check_artifact(&self.pipeline, &self.pipeline.build.source.path)?;

        let rendered = render(&self.pipeline);
        let context = pack_context(&self.pipeline.build.source, &rendered.dockerfile)?;
        result.source_digest = Some(context.digest.clone());

        self.var_ctx.pipeline = (&self.pipeline).into();
        self.var_ctx.run_id = self.run_id.to_string();
        self.var_ctx.source_digest = context.digest.clone();
        let plan = plan_publish(&self.pipeline, &self.var_ctx)?;

        let run_label = HashMap::from([(RUN_LABEL.to_string(), self.run_id.to_string())]);

        let builder_spec = ImageBuildSpec {
            run_id: self.run_id,
            dockerfile: DOCKERFILE_NAME.to_string(),
            context: context.archive.clone(),
            target: Some(BUILD_STAGE_NAME.to_string()),
            tag: refs.builder.clone(),
            labels: run_label.clone(),
        };
        self.run_stage(StageKind::Build, builder_spec, &rendered, result)
            .await?;

        let mut labels = run_label;
        labels.extend(plan.labels.clone());
        let release_spec = ImageBuildSpec {
            run_id: self.run_id,
            dockerfile: DOCKERFILE_NAME.to_string(),
            context: context.archive,
            target: None,
            tag: refs.release.clone(),
            labels,
        };
        let image_id = self
            .run_stage(StageKind::Release, release_spec, &rendered, result)
            .await?;
        result.image_id = Some(image_id);

        if self.options.verify {
            let verifier = Verifier::new(self.builder.clone(), self.pipeline.clone());
            let report = match verifier.verify(&refs.release).await {
                Ok(report) => report,
                Err(e) => {
                    self.discard(&refs.release).await;
                    return Err(e);
                }
            };
            result.report = Some(report.clone());
            self.send(PipelineEvent::VerificationCompleted {
                report: report.clone(),
            })
            .await;

            if !report.passed() {
                self.discard(&refs.release).await;
                return Err(Error::VerificationFailed(report.summary()));
            }
        }

        result.tags = self.publish(&refs.release, &plan).await?;
        Ok(())
    }

    /// Build one stage and record its outcome.
    async fn run_stage(
        &self,
        stage: StageKind,
        spec: ImageBuildSpec,
        rendered: &RenderedBuild,
        result: &mut PipelineResult,
    ) -> Result<String> {
        {
            let entry = result.stage_mut(stage);
            entry.status = StageStatus::Running;
            entry.started_at = Some(Utc::now());
        }
        self.send(PipelineEvent::StageStarted { stage }).await;
        info!(run = %self.run_id, stage = %stage, tag = %spec.tag, "Stage started");

        let outcome = self.build(stage, spec, rendered).await;

        let entry = result.stage_mut(stage);
        entry.finished_at = Some(Utc::now());
        match &outcome {
            Ok(image_id) => {
                info!(run = %self.run_id, stage = %stage, image = %image_id, "Stage completed successfully");
                entry.status = StageStatus::Succeeded;
                entry.image_id = Some(image_id.clone());
            }
            Err(e) => {
                error!(run = %self.run_id, stage = %stage, error = %e, "Stage failed");
                entry.status = StageStatus::Failed {
                    message: e.to_string(),
                };
            }
        }
        self.send(PipelineEvent::StageCompleted {
            stage,
            success: outcome.is_ok(),
        })
        .await;

        outcome
    }

    /// Drive an image build, forwarding progress and classifying failures by
    /// the step that was running.
    async fn build(
        &self,
        stage: StageKind,
        spec: ImageBuildSpec,
        rendered: &RenderedBuild,
    ) -> Result<String> {
        let mut stream = self.builder.build(spec).await?;
        let mut current: Option<PipelineOperation> = None;
        let mut image_id = None;

        while let Some(progress) = stream.next().await {
            match progress {
                BuildProgress::Step {
                    index,
                    total,
                    instruction,
                } => {
                    let step = rendered.step_for(&instruction);
                    current = step.map(|s| s.operation);
                    // A full build replays the Build Stage steps from cache.
                    if step.is_some_and(|s| s.stage != stage) {
                        continue;
                    }
                    self.send(PipelineEvent::StepStarted {
                        stage,
                        index,
                        total,
                        operation: current,
                        instruction,
                    })
                    .await;
                }
                BuildProgress::Log(line) => {
                    self.send(PipelineEvent::StageLog { stage, line }).await;
                }
                BuildProgress::Error { message } => {
                    return Err(match current {
                        Some(operation) => self.pipeline.classify_failure(operation, message),
                        None => Error::ExecutionFailed(message),
                    });
                }
                BuildProgress::Built { image_id: id } => {
                    image_id = Some(id);
                }
            }
        }

        image_id.ok_or_else(|| {
            Error::ExecutionFailed(format!("{} stage finished without an image", stage))
        })
    }

    /// Tag the verified image under every planned reference and push them
    /// when asked to. Any failure untags what was applied so far.
    async fn publish(&self, release_ref: &str, plan: &PublishPlan) -> Result<Vec<String>> {
        let push = self.options.push || self.pipeline.publish.push;
        let mut tagged: Vec<String> = Vec::new();

        for reference in &plan.tags {
            if let Err(e) = self.builder.tag(release_ref, reference).await {
                self.unpublish(release_ref, &tagged).await;
                return Err(e);
            }
            info!(run = %self.run_id, reference = %reference, "Tagged image");
            tagged.push(reference.clone());
        }

        if push {
            for reference in &plan.tags {
                if let Err(e) = self.builder.push(reference).await {
                    self.unpublish(release_ref, &tagged).await;
                    return Err(e);
                }
                info!(run = %self.run_id, reference = %reference, "Pushed image");
            }
        }

        for reference in &plan.tags {
            self.send(PipelineEvent::Published {
                reference: reference.clone(),
                pushed: push,
            })
            .await;
        }

        // The image stays reachable through its published tags.
        if let Err(e) = self.builder.remove(release_ref).await {
            warn!(image = %release_ref, error = %e, "Failed to remove run-scoped reference");
        }

        Ok(tagged)
    }

    /// Drop local tags applied by a failed publish, then the image itself.
    async fn unpublish(&self, release_ref: &str, tagged: &[String]) {
        for reference in tagged {
            self.discard(reference).await;
        }
        self.discard(release_ref).await;
    }

    async fn discard(&self, reference: &str) {
        info!(run = %self.run_id, image = %reference, "Removing unpublished image");
        if let Err(e) = self.builder.remove(reference).await {
            warn!(image = %reference, error = %e, "Failed to remove image");
        }
    }

    async fn send(&self, event: PipelineEvent) {
        let _ = self.tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::BoxStream;
    use shipwright_core::builder::{ImageInfo, LogStream, ProbeOutput, ProbeSpec};
    use shipwright_core::pipeline::{BuildStage, PublishSpec, ReleaseStage};
    use std::sync::Mutex;

    /// A builder that replays the rendered steps and answers probes like a
    /// well-formed release image.
    struct MockImageBuilder {
        pipeline: ReleasePipeline,
        fail_on: Option<(&'static str, &'static str)>,
        extra_package: Option<&'static str>,
        /// A `tag:<ref>` or `push:<ref>` call that fails.
        refuse: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl MockImageBuilder {
        fn healthy(pipeline: &ReleasePipeline) -> Self {
            Self {
                pipeline: pipeline.clone(),
                fail_on: None,
                extra_package: None,
                refuse: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(
            pipeline: &ReleasePipeline,
            needle: &'static str,
            message: &'static str,
        ) -> Self {
            Self {
                fail_on: Some((needle, message)),
                ..Self::healthy(pipeline)
            }
        }

        fn refusing(pipeline: &ReleasePipeline, call: &str) -> Self {
            Self {
                refuse: Some(call.to_string()),
                ..Self::healthy(pipeline)
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn record_or_refuse(&self, call: String) -> Result<()> {
            let refused = self.refuse.as_ref() == Some(&call);
            self.record(call);
            if refused {
                return Err(Error::ExecutionFailed("registry refused".to_string()));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn called(&self, prefix: &str) -> bool {
            self.calls().iter().any(|c| c.starts_with(prefix))
        }
    }

    #[async_trait::async_trait]
    impl ImageBuilder for MockImageBuilder {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn available(&self) -> bool {
            true
        }

        async fn build(&self, spec: ImageBuildSpec) -> Result<BoxStream<'static, BuildProgress>> {
            self.record(format!(
                "build:{}",
                spec.target.as_deref().unwrap_or("final")
            ));

            let rendered = render(&self.pipeline);
            let steps: Vec<_> = rendered
                .steps
                .iter()
                .filter(|s| spec.target.is_none() || s.stage == StageKind::Build)
                .collect();
            let total = steps.len() as u32;

            let mut items = Vec::new();
            for (i, step) in steps.iter().enumerate() {
                items.push(BuildProgress::Step {
                    index: i as u32 + 1,
                    total,
                    instruction: step.instruction.clone(),
                });
                if let Some((needle, message)) = self.fail_on {
                    if step.instruction.contains(needle) {
                        items.push(BuildProgress::Error {
                            message: message.to_string(),
                        });
                        return Ok(Box::pin(futures::stream::iter(items)));
                    }
                }
                items.push(BuildProgress::Log(LogLine::new(LogStream::Stdout, " ---> ok")));
            }
            items.push(BuildProgress::Built {
                image_id: format!("sha256:{}", spec.tag),
            });
            Ok(Box::pin(futures::stream::iter(items)))
        }

        async fn inspect(&self, reference: &str) -> Result<ImageInfo> {
            self.record(format!("inspect:{}", reference));
            Ok(ImageInfo {
                id: format!("sha256:{}", reference),
                entrypoint: vec![self.pipeline.handoff().destination_path],
                ..Default::default()
            })
        }

        async fn probe(&self, spec: ProbeSpec) -> Result<ProbeOutput> {
            let script = spec.entrypoint.last().cloned().unwrap_or_default();
            self.record(format!("probe:{}", script));

            let stdout = if script.starts_with("find /") {
                format!("{}\n#executable\n", self.pipeline.handoff().destination_path)
            } else if script == "apt-mark showmanual" {
                let mut packages = vec!["apt".to_string(), "base-files".to_string()];
                if spec.image != self.pipeline.release.base.reference() {
                    packages.extend(self.pipeline.release.dependencies.packages().to_vec());
                    packages.extend(self.extra_package.map(str::to_string));
                }
                packages.join("\n")
            } else if script == "env" {
                let mut env: HashMap<String, String> =
                    self.pipeline.release.process.to_env().into_iter().collect();
                env.extend(spec.env.clone());
                env.iter()
                    .map(|(k, v)| format!("{}={}\n", k, v))
                    .collect()
            } else {
                String::new()
            };

            Ok(ProbeOutput {
                exit_code: 0,
                stdout,
            })
        }

        async fn tag(&self, _image: &str, reference: &str) -> Result<()> {
            self.record_or_refuse(format!("tag:{}", reference))
        }

        async fn push(&self, reference: &str) -> Result<()> {
            self.record_or_refuse(format!("push:{}", reference))
        }

        async fn remove(&self, reference: &str) -> Result<()> {
            self.record(format!("remove:{}", reference));
            Ok(())
        }
    }

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"scoreboard\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        dir
    }

    fn pipeline(source: &tempfile::TempDir) -> ReleasePipeline {
        let mut build = BuildStage::default();
        build.source.path = source.path().to_path_buf();
        ReleasePipeline {
            name: "scoreboard".to_string(),
            artifact: "scoreboard".to_string(),
            build,
            release: ReleaseStage::default(),
            publish: PublishSpec {
                tags: vec!["scoreboard:latest".to_string()],
                ..Default::default()
            },
        }
    }

    async fn run(
        builder: Arc<MockImageBuilder>,
        pipeline: &ReleasePipeline,
        options: RunOptions,
    ) -> (Vec<PipelineEvent>, PipelineResult) {
        let orchestrator = PipelineOrchestrator::with_options(builder, options);
        let (mut rx, handle) = orchestrator.execute(pipeline, VariableContext::new());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, handle.await.unwrap())
    }

    #[tokio::test]
    async fn test_successful_run_builds_verifies_and_publishes() {
        let source = source_tree();
        let pipeline = pipeline(&source);
        let builder = Arc::new(MockImageBuilder::healthy(&pipeline));

        let (events, result) = run(builder.clone(), &pipeline, RunOptions::default()).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.tags, vec!["scoreboard:latest"]);
        assert!(result.report.as_ref().unwrap().passed());
        assert!(result.source_digest.is_some());
        assert!(result.stages.iter().all(|s| s.status.is_success()));

        let calls = builder.calls();
        let build_idx = calls.iter().position(|c| c == "build:builder").unwrap();
        let release_idx = calls.iter().position(|c| c == "build:final").unwrap();
        let tag_idx = calls.iter().position(|c| c == "tag:scoreboard:latest").unwrap();
        assert!(build_idx < release_idx);
        assert!(release_idx < tag_idx);
        assert!(!builder.called("push:"));

        // Builder image torn down after the run.
        let refs = RunRefs::new(&pipeline, &result.run_id);
        assert!(calls.contains(&format!("remove:{}", refs.builder)));

        assert!(matches!(
            events.last(),
            Some(PipelineEvent::PipelineCompleted { success: true })
        ));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::Published { reference, pushed: false } if reference == "scoreboard:latest"
        )));
    }

    #[tokio::test]
    async fn test_release_steps_are_reported_once() {
        let source = source_tree();
        let pipeline = pipeline(&source);
        let builder = Arc::new(MockImageBuilder::healthy(&pipeline));

        let (events, _) = run(builder, &pipeline, RunOptions::default()).await;

        let compile_steps = events
            .iter()
            .filter(|e| matches!(
                e,
                PipelineEvent::StepStarted { operation: Some(PipelineOperation::Compile), .. }
            ))
            .count();
        assert_eq!(compile_steps, 1);
    }

    #[tokio::test]
    async fn test_compile_failure_never_starts_release() {
        let source = source_tree();
        let pipeline = pipeline(&source);
        let builder = Arc::new(MockImageBuilder::failing_on(
            &pipeline,
            "cargo build",
            "The command '/bin/sh -c cargo build --release' returned a non-zero code: 101",
        ));

        let (events, result) = run(builder.clone(), &pipeline, RunOptions::default()).await;

        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().starts_with("compile error:"));
        assert!(matches!(
            result.stage(StageKind::Build).unwrap().status,
            StageStatus::Failed { .. }
        ));
        assert!(matches!(
            result.stage(StageKind::Release).unwrap().status,
            StageStatus::Skipped { .. }
        ));
        assert!(result.image_id.is_none());

        assert!(!builder.called("build:final"));
        assert!(!builder.called("tag:"));
        assert!(!events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageStarted { stage: StageKind::Release }
        )));
    }

    #[tokio::test]
    async fn test_dependency_failure_publishes_nothing() {
        let source = source_tree();
        let pipeline = pipeline(&source);
        let builder = Arc::new(MockImageBuilder::failing_on(
            &pipeline,
            "apt-get install",
            "E: Unable to locate package libpq-dev",
        ));

        let (_, result) = run(builder.clone(), &pipeline, RunOptions::default()).await;

        assert!(!result.success);
        let error = result.error.clone().unwrap();
        assert!(error.starts_with("failed to install runtime dependencies [libpq-dev, ca-certificates, libssl-dev]"));
        assert!(result.stage(StageKind::Build).unwrap().status.is_success());
        assert!(matches!(
            result.stage(StageKind::Release).unwrap().status,
            StageStatus::Failed { .. }
        ));
        assert!(!builder.called("tag:"));
        assert!(!builder.called("push:"));

        let refs = RunRefs::new(&pipeline, &result.run_id);
        assert!(builder.calls().contains(&format!("remove:{}", refs.builder)));
    }

    #[tokio::test]
    async fn test_missing_artifact_is_classified() {
        let source = source_tree();
        let pipeline = pipeline(&source);
        let builder = Arc::new(MockImageBuilder::failing_on(
            &pipeline,
            "test -x",
            "artifact 'scoreboard' was not produced",
        ));

        let (_, result) = run(builder, &pipeline, RunOptions::default()).await;
        assert!(
            result
                .error
                .unwrap()
                .starts_with("artifact path mismatch: expected /usr/src/app/target/release/scoreboard")
        );
    }

    #[tokio::test]
    async fn test_verification_failure_discards_image() {
        let source = source_tree();
        let pipeline = pipeline(&source);
        let builder = Arc::new(MockImageBuilder {
            extra_package: Some("curl"),
            ..MockImageBuilder::healthy(&pipeline)
        });

        let (events, result) = run(builder.clone(), &pipeline, RunOptions::default()).await;

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("verification failed: dependencies: extra [curl]")
        );
        assert!(!builder.called("tag:"));

        let refs = RunRefs::new(&pipeline, &result.run_id);
        assert!(builder.calls().contains(&format!("remove:{}", refs.release)));
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::VerificationCompleted { .. })));
    }

    #[tokio::test]
    async fn test_no_verify_skips_probes() {
        let source = source_tree();
        let pipeline = pipeline(&source);
        let builder = Arc::new(MockImageBuilder {
            extra_package: Some("curl"),
            ..MockImageBuilder::healthy(&pipeline)
        });
        let options = RunOptions {
            verify: false,
            ..Default::default()
        };

        let (_, result) = run(builder.clone(), &pipeline, options).await;
        assert!(result.success);
        assert!(result.report.is_none());
        assert!(!builder.called("probe:"));
    }

    #[tokio::test]
    async fn test_push_and_keep_builder() {
        let source = source_tree();
        let mut pipeline = pipeline(&source);
        pipeline.publish.tags = vec![
            "registry.example.com/scoreboard:latest".to_string(),
            "registry.example.com/scoreboard:${run.id}".to_string(),
        ];
        let builder = Arc::new(MockImageBuilder::healthy(&pipeline));
        let options = RunOptions {
            push: true,
            keep_builder: true,
            ..Default::default()
        };

        let (_, result) = run(builder.clone(), &pipeline, options).await;
        assert!(result.success, "{:?}", result.error);

        let calls = builder.calls();
        assert!(calls.contains(&"push:registry.example.com/scoreboard:latest".to_string()));
        assert!(calls.contains(&format!(
            "push:registry.example.com/scoreboard:{}",
            result.run_id
        )));

        let refs = RunRefs::new(&pipeline, &result.run_id);
        assert!(!calls.contains(&format!("remove:{}", refs.builder)));
    }

    #[tokio::test]
    async fn test_artifact_mismatch_stops_before_building() {
        let source = source_tree();
        let mut pipeline = pipeline(&source);
        pipeline.artifact = "score-board".to_string();
        let builder = Arc::new(MockImageBuilder::healthy(&pipeline));

        let (_, result) = run(builder.clone(), &pipeline, RunOptions::default()).await;

        assert!(!result.success);
        assert!(
            result
                .error
                .as_deref()
                .unwrap()
                .starts_with("artifact path mismatch")
        );
        assert!(builder.calls().is_empty());
        assert!(result.stages.iter().all(|s| matches!(s.status, StageStatus::Skipped { .. })));
    }

    #[tokio::test]
    async fn test_tag_failure_untags_earlier_references() {
        let source = source_tree();
        let mut pipeline = pipeline(&source);
        pipeline.publish.tags = vec![
            "scoreboard:latest".to_string(),
            "scoreboard:v1".to_string(),
        ];
        let builder = Arc::new(MockImageBuilder::refusing(&pipeline, "tag:scoreboard:v1"));

        let (events, result) = run(builder.clone(), &pipeline, RunOptions::default()).await;

        assert!(!result.success);
        assert!(result.tags.is_empty());
        assert!(result.error.as_deref().unwrap().contains("registry refused"));

        let calls = builder.calls();
        let refs = RunRefs::new(&pipeline, &result.run_id);
        assert!(calls.contains(&"remove:scoreboard:latest".to_string()));
        assert!(calls.contains(&format!("remove:{}", refs.release)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Published { .. })));
    }

    #[tokio::test]
    async fn test_push_failure_untags_everything() {
        let source = source_tree();
        let mut pipeline = pipeline(&source);
        pipeline.publish.tags = vec![
            "r.example.com/scoreboard:latest".to_string(),
            "r.example.com/scoreboard:v1".to_string(),
        ];
        let builder = Arc::new(MockImageBuilder::refusing(
            &pipeline,
            "push:r.example.com/scoreboard:v1",
        ));
        let options = RunOptions {
            push: true,
            ..Default::default()
        };

        let (events, result) = run(builder.clone(), &pipeline, options).await;

        assert!(!result.success);
        let calls = builder.calls();
        let refs = RunRefs::new(&pipeline, &result.run_id);
        assert!(calls.contains(&"remove:r.example.com/scoreboard:latest".to_string()));
        assert!(calls.contains(&"remove:r.example.com/scoreboard:v1".to_string()));
        assert!(calls.contains(&format!("remove:{}", refs.release)));
        assert!(calls.contains(&format!("remove:{}", refs.builder)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Published { .. })));
    }
}
