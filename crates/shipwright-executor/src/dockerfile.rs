//! Multi-stage Dockerfile rendering.
//!
//! Every instruction is rendered on a single line and recorded with the
//! pipeline operation it implements, so a failing build step reported by the
//! engine can be traced back to the operation that failed.

use shipwright_core::pipeline::{
    BUILD_STAGE_NAME, PipelineOperation, RELEASE_STAGE_NAME, ReleasePipeline, StageKind,
};

/// Name of the rendered Dockerfile inside the build context.
pub const DOCKERFILE_NAME: &str = "Dockerfile.shipwright";

/// One rendered instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedStep {
    pub stage: StageKind,
    pub operation: PipelineOperation,
    pub instruction: String,
}

/// A rendered build definition.
#[derive(Debug, Clone)]
pub struct RenderedBuild {
    pub dockerfile: String,
    pub steps: Vec<RenderedStep>,
}

impl RenderedBuild {
    /// Find the step an engine-reported instruction belongs to.
    ///
    /// Engines echo the instruction text; some upper-case the keyword or
    /// collapse whitespace, so both sides are normalized first.
    pub fn step_for(&self, instruction: &str) -> Option<&RenderedStep> {
        let wanted = normalize(instruction);
        self.steps
            .iter()
            .find(|s| normalize(&s.instruction) == wanted)
    }

    /// Steps of one stage, in order.
    pub fn stage_steps(&self, stage: StageKind) -> impl Iterator<Item = &RenderedStep> {
        self.steps.iter().filter(move |s| s.stage == stage)
    }
}

fn normalize(instruction: &str) -> String {
    let mut parts = instruction.split_whitespace();
    let keyword = parts.next().unwrap_or("").to_ascii_uppercase();
    std::iter::once(keyword)
        .chain(parts.map(str::to_string))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render the pipeline as a two-stage Dockerfile.
pub fn render(pipeline: &ReleasePipeline) -> RenderedBuild {
    let handoff = pipeline.handoff();
    let build = &pipeline.build;
    let release = &pipeline.release;
    let mut steps = Vec::new();

    let mut push = |stage, operation, instruction: String| {
        steps.push(RenderedStep {
            stage,
            operation,
            instruction,
        });
    };

    // Build Stage
    push(
        StageKind::Build,
        PipelineOperation::ProvisionToolchain,
        format!(
            "FROM {} AS {}",
            build.toolchain.reference(),
            BUILD_STAGE_NAME
        ),
    );
    push(
        StageKind::Build,
        PipelineOperation::StageSource,
        format!("WORKDIR {}", build.workdir),
    );
    push(
        StageKind::Build,
        PipelineOperation::StageSource,
        "COPY . .".to_string(),
    );
    push(
        StageKind::Build,
        PipelineOperation::Compile,
        format!("RUN {}", build.compile_command().join(" ")),
    );
    push(
        StageKind::Build,
        PipelineOperation::CopyArtifact,
        format!(
            "RUN test -x {path} || (echo \"artifact '{name}' was not produced at {path}\" >&2 && exit 1)",
            path = handoff.source_path,
            name = handoff.name
        ),
    );

    // Release Stage
    push(
        StageKind::Release,
        PipelineOperation::ProvisionBase,
        format!(
            "FROM {} AS {}",
            release.base.reference(),
            RELEASE_STAGE_NAME
        ),
    );
    push(
        StageKind::Release,
        PipelineOperation::InstallDependencies,
        format!(
            "RUN apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {} && apt-get clean && rm -rf /var/lib/apt/lists/*",
            release.dependencies.packages().join(" ")
        ),
    );
    push(
        StageKind::Release,
        PipelineOperation::CopyArtifact,
        format!(
            "COPY --from={} {} {}",
            BUILD_STAGE_NAME, handoff.source_path, handoff.destination_path
        ),
    );
    push(
        StageKind::Release,
        PipelineOperation::Configure,
        format!(
            "ENV {}",
            release
                .process
                .to_env()
                .iter()
                .map(|(k, v)| format!("{}={}", k, quote_env_value(v)))
                .collect::<Vec<_>>()
                .join(" ")
        ),
    );
    push(
        StageKind::Release,
        PipelineOperation::DeclareEntrypoint,
        format!(
            "ENTRYPOINT {}",
            serde_json::Value::from(vec![handoff.destination_path.clone()])
        ),
    );

    let mut dockerfile = format!(
        "# Generated by shipwright for pipeline '{}'. Do not edit.\n",
        pipeline.name
    );
    for step in &steps {
        if step.operation == PipelineOperation::ProvisionBase {
            dockerfile.push('\n');
        }
        dockerfile.push_str(&step.instruction);
        dockerfile.push('\n');
    }

    RenderedBuild { dockerfile, steps }
}

/// Render the exclusion list as a `.dockerignore`, for building the same
/// Dockerfile outside of shipwright.
pub fn render_dockerignore(pipeline: &ReleasePipeline) -> String {
    pipeline
        .build
        .source
        .exclusions()
        .iter()
        .map(|p| format!("{}\n", p))
        .collect()
}

fn quote_env_value(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/:,".contains(c));
    if plain {
        return value.to_string();
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_core::pipeline::{BuildStage, PublishSpec, ReleaseStage};

    fn pipeline() -> ReleasePipeline {
        ReleasePipeline {
            name: "scoreboard".to_string(),
            artifact: "scoreboard".to_string(),
            build: BuildStage::default(),
            release: ReleaseStage::default(),
            publish: PublishSpec::default(),
        }
    }

    #[test]
    fn test_render_default_pipeline() {
        let rendered = render(&pipeline());
        let expected = "\
# Generated by shipwright for pipeline 'scoreboard'. Do not edit.
FROM rust:1.85 AS builder
WORKDIR /usr/src/app
COPY . .
RUN cargo build --release
RUN test -x /usr/src/app/target/release/scoreboard || (echo \"artifact 'scoreboard' was not produced at /usr/src/app/target/release/scoreboard\" >&2 && exit 1)

FROM debian:bookworm-slim AS release
RUN apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends libpq-dev ca-certificates libssl-dev && apt-get clean && rm -rf /var/lib/apt/lists/*
COPY --from=builder /usr/src/app/target/release/scoreboard /usr/local/bin/scoreboard
ENV RUST_LOG=info RUST_BACKTRACE=1
ENTRYPOINT [\"/usr/local/bin/scoreboard\"]
";
        assert_eq!(rendered.dockerfile, expected);
    }

    #[test]
    fn test_only_the_artifact_crosses_stages() {
        let rendered = render(&pipeline());
        let cross: Vec<_> = rendered
            .stage_steps(StageKind::Release)
            .filter(|s| s.instruction.contains("--from="))
            .collect();
        assert_eq!(cross.len(), 1);
        assert_eq!(cross[0].operation, PipelineOperation::CopyArtifact);
        assert!(
            !rendered
                .stage_steps(StageKind::Release)
                .any(|s| s.instruction.contains("rust:"))
        );
    }

    #[test]
    fn test_step_lookup_normalizes_instruction() {
        let rendered = render(&pipeline());
        let step = rendered
            .step_for("run   cargo build --release")
            .expect("compile step");
        assert_eq!(step.operation, PipelineOperation::Compile);
        assert_eq!(step.stage, StageKind::Build);

        let step = rendered.step_for("FROM debian:bookworm-slim AS release").unwrap();
        assert_eq!(step.operation, PipelineOperation::ProvisionBase);

        assert!(rendered.step_for("RUN make").is_none());
    }

    #[test]
    fn test_env_values_are_quoted_when_needed() {
        let mut p = pipeline();
        p.release
            .process
            .extra
            .insert("GREETING".to_string(), "hello world".to_string());
        p.release
            .process
            .extra
            .insert("ROCKET_ADDRESS".to_string(), "0.0.0.0".to_string());
        let rendered = render(&p);
        assert!(rendered.dockerfile.contains(
            "ENV RUST_LOG=info RUST_BACKTRACE=1 GREETING=\"hello world\" ROCKET_ADDRESS=0.0.0.0\n"
        ));
    }

    #[test]
    fn test_entrypoint_has_no_arguments_and_no_cmd() {
        let rendered = render(&pipeline());
        let last = rendered.steps.last().unwrap();
        assert_eq!(last.operation, PipelineOperation::DeclareEntrypoint);
        assert_eq!(last.instruction, "ENTRYPOINT [\"/usr/local/bin/scoreboard\"]");
        assert!(!rendered.dockerfile.contains("\nCMD "));
    }

    #[test]
    fn test_dockerignore() {
        let mut p = pipeline();
        assert_eq!(render_dockerignore(&p), "");
        p.build.source.exclude = vec!["target/".to_string(), "./.git".to_string()];
        assert_eq!(render_dockerignore(&p), "target\n.git\n");
    }
}
