//! Post-build verification of a release image.
//!
//! Every check runs a short-lived probe container from the image with the
//! entry point replaced by a shell script, then evaluates the probe output.
//! Evaluation is kept separate from probing so it can be tested without a
//! Docker daemon.

use shipwright_core::builder::{ImageBuilder, ImageInfo, ProbeOutput, ProbeSpec};
use shipwright_core::pipeline::{ArtifactHandoff, ReleasePipeline};
use shipwright_core::process::{BACKTRACE_VAR, LOG_LEVEL_VAR, LogLevel, ProcessConfig};
use shipwright_core::verify::{CheckOutcome, VerificationReport};
use shipwright_core::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

pub const ARTIFACT_CHECK: &str = "artifact";
pub const TOOLCHAIN_CHECK: &str = "toolchain-absent";
pub const DEPENDENCIES_CHECK: &str = "dependencies";
pub const CONFIGURATION_CHECK: &str = "configuration";
pub const ENTRYPOINT_CHECK: &str = "entrypoint";

/// Executables that must not resolve in a runtime image.
const TOOLCHAIN_BINARIES: [&str; 5] = ["cargo", "rustc", "cc", "gcc", "ld"];

/// Where the official toolchain images install cargo.
const CARGO_HOME: &str = "/usr/local/cargo";

const EXECUTABLE_MARKER: &str = "#executable";

/// Runs the verification checks for one pipeline.
pub struct Verifier {
    builder: Arc<dyn ImageBuilder>,
    pipeline: ReleasePipeline,
}

impl Verifier {
    pub fn new(builder: Arc<dyn ImageBuilder>, pipeline: ReleasePipeline) -> Self {
        Self { builder, pipeline }
    }

    /// Run every check against `image`. Check failures are recorded in the
    /// report. Errors are reserved for the builder itself failing.
    pub async fn verify(&self, image: &str) -> Result<VerificationReport> {
        let handoff = self.pipeline.handoff();
        let mut report = VerificationReport::new(image);

        let info = self.builder.inspect(image).await?;
        report.push(evaluate_entrypoint(&info, &handoff));

        let output = self
            .builder
            .probe(ProbeSpec::shell(image, artifact_script(&handoff)))
            .await?;
        report.push(evaluate_artifact(&output, &handoff));

        let output = self
            .builder
            .probe(ProbeSpec::shell(image, toolchain_script()))
            .await?;
        report.push(evaluate_toolchain(&output));

        let base = self.pipeline.release.base.reference();
        let installed = self
            .builder
            .probe(ProbeSpec::shell(image, "apt-mark showmanual"))
            .await?;
        let baseline = self
            .builder
            .probe(ProbeSpec::shell(base, "apt-mark showmanual"))
            .await?;
        report.push(evaluate_dependencies(
            self.pipeline.release.dependencies.packages(),
            &installed,
            &baseline,
        ));

        report.push(self.check_configuration(image).await?);

        for check in &report.checks {
            debug!(image = %image, check = %check.name, passed = check.passed, detail = %check.detail, "Verification check");
        }
        info!(image = %image, passed = report.passed(), "Verification finished");

        Ok(report)
    }

    async fn check_configuration(&self, image: &str) -> Result<CheckOutcome> {
        let declared = &self.pipeline.release.process;

        let defaults = self.builder.probe(ProbeSpec::shell(image, "env")).await?;

        let overrides = launch_overrides(declared);
        let mut spec = ProbeSpec::shell(image, "env");
        spec.env = overrides.clone();
        let overridden = self.builder.probe(spec).await?;

        Ok(evaluate_configuration(
            declared,
            &defaults,
            &overrides,
            &overridden,
        ))
    }
}

fn artifact_script(handoff: &ArtifactHandoff) -> String {
    format!(
        "find / -xdev -type f -name '{name}' 2>/dev/null; if [ -x '{path}' ]; then echo '{marker}'; fi; exit 0",
        name = handoff.name,
        path = handoff.destination_path,
        marker = EXECUTABLE_MARKER
    )
}

fn toolchain_script() -> String {
    format!(
        "for tool in {}; do command -v \"$tool\"; done; if [ -e {cargo} ]; then echo {cargo}; fi; exit 0",
        TOOLCHAIN_BINARIES.join(" "),
        cargo = CARGO_HOME
    )
}

fn probe_failed(name: &str, output: &ProbeOutput) -> Option<CheckOutcome> {
    (!output.success()).then(|| {
        CheckOutcome::fail(
            name,
            format!("probe exited with code {}", output.exit_code),
        )
    })
}

/// Exactly one file named after the artifact, executable, at the
/// destination path.
pub fn evaluate_artifact(output: &ProbeOutput, handoff: &ArtifactHandoff) -> CheckOutcome {
    if let Some(failed) = probe_failed(ARTIFACT_CHECK, output) {
        return failed;
    }

    let found: Vec<&str> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('/'))
        .collect();
    let executable = output.stdout.lines().any(|l| l.trim() == EXECUTABLE_MARKER);

    match found.as_slice() {
        [] => CheckOutcome::fail(
            ARTIFACT_CHECK,
            format!("no file named '{}' in the image", handoff.name),
        ),
        [path] if *path != handoff.destination_path => CheckOutcome::fail(
            ARTIFACT_CHECK,
            format!(
                "'{}' found at {} instead of {}",
                handoff.name, path, handoff.destination_path
            ),
        ),
        [path] if !executable => {
            CheckOutcome::fail(ARTIFACT_CHECK, format!("{} is not executable", path))
        }
        [path] => CheckOutcome::pass(ARTIFACT_CHECK, format!("{} is executable", path)),
        paths => CheckOutcome::fail(
            ARTIFACT_CHECK,
            format!(
                "{} copies of '{}' found: {}",
                paths.len(),
                handoff.name,
                paths.join(", ")
            ),
        ),
    }
}

/// Nothing from the toolchain resolves in the image.
pub fn evaluate_toolchain(output: &ProbeOutput) -> CheckOutcome {
    if let Some(failed) = probe_failed(TOOLCHAIN_CHECK, output) {
        return failed;
    }

    let present: Vec<&str> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if present.is_empty() {
        CheckOutcome::pass(TOOLCHAIN_CHECK, "no toolchain binaries on PATH")
    } else {
        CheckOutcome::fail(
            TOOLCHAIN_CHECK,
            format!("toolchain present: {}", present.join(", ")),
        )
    }
}

fn package_set(output: &ProbeOutput) -> BTreeSet<&str> {
    output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        // Multi-arch packages are listed as name:arch.
        .map(|l| l.split(':').next().unwrap_or(l))
        .collect()
}

/// The packages the Release Stage added to the base are exactly the
/// declared ones.
///
/// A declared package counts as installed when it is manually installed in
/// the image, even if the base image already had it. Extra packages are the
/// ones manually installed in the image but neither in the base nor declared.
pub fn evaluate_dependencies(
    declared: &[String],
    installed: &ProbeOutput,
    baseline: &ProbeOutput,
) -> CheckOutcome {
    if let Some(failed) = probe_failed(DEPENDENCIES_CHECK, installed) {
        return failed;
    }
    if let Some(failed) = probe_failed(DEPENDENCIES_CHECK, baseline) {
        return CheckOutcome::fail(
            DEPENDENCIES_CHECK,
            format!("base image {}", failed.detail),
        );
    }

    let installed = package_set(installed);
    let baseline = package_set(baseline);
    let declared: BTreeSet<&str> = declared.iter().map(String::as_str).collect();

    let missing: Vec<&str> = declared.difference(&installed).copied().collect();
    let extra: Vec<&str> = installed
        .difference(&baseline)
        .filter(|p| !declared.contains(*p))
        .copied()
        .collect();

    if missing.is_empty() && extra.is_empty() {
        return CheckOutcome::pass(
            DEPENDENCIES_CHECK,
            format!("installed [{}]", declared.iter().copied().collect::<Vec<_>>().join(", ")),
        );
    }

    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("missing [{}]", missing.join(", ")));
    }
    if !extra.is_empty() {
        problems.push(format!("extra [{}]", extra.join(", ")));
    }
    CheckOutcome::fail(DEPENDENCIES_CHECK, problems.join(", "))
}

/// Overrides used to check launch-time configuration wins: a different log
/// level and the opposite backtrace setting.
pub fn launch_overrides(declared: &ProcessConfig) -> HashMap<String, String> {
    let level = if declared.log_level == LogLevel::Debug {
        LogLevel::Trace
    } else {
        LogLevel::Debug
    };
    let backtrace = if declared.backtrace { "0" } else { "1" };
    HashMap::from([
        (LOG_LEVEL_VAR.to_string(), level.to_string()),
        (BACKTRACE_VAR.to_string(), backtrace.to_string()),
    ])
}

/// Without overrides the process sees the declared configuration, with
/// overrides it sees the overrides.
pub fn evaluate_configuration(
    declared: &ProcessConfig,
    defaults: &ProbeOutput,
    overrides: &HashMap<String, String>,
    overridden: &ProbeOutput,
) -> CheckOutcome {
    for output in [defaults, overridden] {
        if let Some(failed) = probe_failed(CONFIGURATION_CHECK, output) {
            return failed;
        }
    }

    let vars: BTreeMap<&str, &str> = defaults
        .stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .collect();
    let env = declared.to_env();
    let missing: Vec<&str> = env
        .iter()
        .map(|(k, _)| k.as_str())
        .filter(|k| !vars.contains_key(k))
        .collect();
    if !missing.is_empty() {
        return CheckOutcome::fail(
            CONFIGURATION_CHECK,
            format!("not set in the image: {}", missing.join(", ")),
        );
    }

    match declared.from_env_lines(&defaults.stdout) {
        Ok(observed) if observed == *declared => {}
        Ok(observed) => {
            return CheckOutcome::fail(
                CONFIGURATION_CHECK,
                format!(
                    "defaults are {}={} {}={}, expected {}={} {}={}",
                    LOG_LEVEL_VAR,
                    observed.log_level,
                    BACKTRACE_VAR,
                    u8::from(observed.backtrace),
                    LOG_LEVEL_VAR,
                    declared.log_level,
                    BACKTRACE_VAR,
                    u8::from(declared.backtrace)
                ),
            );
        }
        Err(e) => return CheckOutcome::fail(CONFIGURATION_CHECK, e.to_string()),
    }

    let expected = match declared.resolve(|key| overrides.get(key).cloned()) {
        Ok(expected) => expected,
        Err(e) => return CheckOutcome::fail(CONFIGURATION_CHECK, e.to_string()),
    };
    match declared.from_env_lines(&overridden.stdout) {
        Ok(observed) if observed == expected => CheckOutcome::pass(
            CONFIGURATION_CHECK,
            format!(
                "defaults {}={} {}={}, launch overrides take effect",
                LOG_LEVEL_VAR,
                declared.log_level,
                BACKTRACE_VAR,
                u8::from(declared.backtrace)
            ),
        ),
        Ok(observed) => CheckOutcome::fail(
            CONFIGURATION_CHECK,
            format!(
                "launch overrides ignored: saw {}={} {}={}",
                LOG_LEVEL_VAR,
                observed.log_level,
                BACKTRACE_VAR,
                u8::from(observed.backtrace)
            ),
        ),
        Err(e) => CheckOutcome::fail(CONFIGURATION_CHECK, e.to_string()),
    }
}

/// The entry point is the artifact alone and there is no default command.
pub fn evaluate_entrypoint(info: &ImageInfo, handoff: &ArtifactHandoff) -> CheckOutcome {
    let expected = vec![handoff.destination_path.clone()];
    if info.entrypoint != expected {
        return CheckOutcome::fail(
            ENTRYPOINT_CHECK,
            format!("entry point is {:?}, expected {:?}", info.entrypoint, expected),
        );
    }
    if !info.cmd.is_empty() {
        return CheckOutcome::fail(
            ENTRYPOINT_CHECK,
            format!("image has a default command {:?}", info.cmd),
        );
    }
    CheckOutcome::pass(ENTRYPOINT_CHECK, format!("{:?}", expected))
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

    fn output(stdout: &str) -> ProbeOutput {
        ProbeOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
        }
    }

    fn declared() -> Vec<String> {
        vec![
            "libpq-dev".to_string(),
            "ca-certificates".to_string(),
            "libssl-dev".to_string(),
        ]
    }

    #[test]
    fn test_artifact_at_destination() {
        let handoff = pipeline().handoff();
        let check = evaluate_artifact(
            &output("/usr/local/bin/scoreboard\n#executable\n"),
            &handoff,
        );
        assert!(check.passed, "{}", check.detail);
    }

    #[test]
    fn test_artifact_missing_misplaced_or_duplicated() {
        let handoff = pipeline().handoff();

        let check = evaluate_artifact(&output(""), &handoff);
        assert!(!check.passed);
        assert!(check.detail.contains("no file named"));

        let check = evaluate_artifact(&output("/opt/scoreboard\n"), &handoff);
        assert!(!check.passed);
        assert!(check.detail.contains("instead of /usr/local/bin/scoreboard"));

        let check = evaluate_artifact(
            &output("/usr/local/bin/scoreboard\n/usr/src/app/target/release/scoreboard\n#executable\n"),
            &handoff,
        );
        assert!(!check.passed);
        assert!(check.detail.starts_with("2 copies"));
    }

    #[test]
    fn test_artifact_not_executable() {
        let handoff = pipeline().handoff();
        let check = evaluate_artifact(&output("/usr/local/bin/scoreboard\n"), &handoff);
        assert!(!check.passed);
        assert!(check.detail.contains("not executable"));
    }

    #[test]
    fn test_toolchain_absent() {
        assert!(evaluate_toolchain(&output("")).passed);

        let check = evaluate_toolchain(&output("/usr/local/cargo/bin/cargo\n/usr/bin/gcc\n"));
        assert!(!check.passed);
        assert_eq!(
            check.detail,
            "toolchain present: /usr/local/cargo/bin/cargo, /usr/bin/gcc"
        );
    }

    #[test]
    fn test_dependency_set_matches() {
        let baseline = output("apt\nbase-files\nbash\n");
        let installed = output("apt\nbase-files\nbash\nca-certificates\nlibpq-dev\nlibssl-dev:amd64\n");
        let check = evaluate_dependencies(&declared(), &installed, &baseline);
        assert!(check.passed, "{}", check.detail);
    }

    #[test]
    fn test_dependency_set_reports_missing_and_extra() {
        let baseline = output("apt\n");
        let installed = output("apt\nca-certificates\nlibpq-dev\ncurl\n");
        let check = evaluate_dependencies(&declared(), &installed, &baseline);
        assert!(!check.passed);
        assert_eq!(check.detail, "missing [libssl-dev], extra [curl]");
    }

    #[test]
    fn test_dependency_already_in_base_counts_as_installed() {
        let baseline = output("apt\nca-certificates\n");
        let installed = output("apt\nca-certificates\nlibpq-dev\nlibssl-dev\n");
        assert!(evaluate_dependencies(&declared(), &installed, &baseline).passed);
    }

    #[test]
    fn test_dependency_probe_failure() {
        let failed = ProbeOutput {
            exit_code: 127,
            stdout: String::new(),
        };
        let check = evaluate_dependencies(&declared(), &failed, &output("apt\n"));
        assert!(!check.passed);
        assert_eq!(check.detail, "probe exited with code 127");
    }

    #[test]
    fn test_configuration_defaults_and_overrides() {
        let declared = ProcessConfig::default();
        let overrides = launch_overrides(&declared);
        assert_eq!(overrides["RUST_LOG"], "debug");
        assert_eq!(overrides["RUST_BACKTRACE"], "0");

        let check = evaluate_configuration(
            &declared,
            &output("PATH=/usr/bin\nRUST_LOG=info\nRUST_BACKTRACE=1\n"),
            &overrides,
            &output("PATH=/usr/bin\nRUST_LOG=debug\nRUST_BACKTRACE=0\n"),
        );
        assert!(check.passed, "{}", check.detail);
    }

    #[test]
    fn test_configuration_missing_from_image() {
        let declared = ProcessConfig::default();
        let overrides = launch_overrides(&declared);
        let check = evaluate_configuration(
            &declared,
            &output("PATH=/usr/bin\nRUST_LOG=info\n"),
            &overrides,
            &output("RUST_LOG=debug\nRUST_BACKTRACE=0\n"),
        );
        assert!(!check.passed);
        assert_eq!(check.detail, "not set in the image: RUST_BACKTRACE");
    }

    #[test]
    fn test_configuration_wrong_default() {
        let declared = ProcessConfig::default();
        let overrides = launch_overrides(&declared);
        let check = evaluate_configuration(
            &declared,
            &output("RUST_LOG=warn\nRUST_BACKTRACE=1\n"),
            &overrides,
            &output("RUST_LOG=debug\nRUST_BACKTRACE=0\n"),
        );
        assert!(!check.passed);
        assert!(check.detail.starts_with("defaults are RUST_LOG=warn"));
    }

    #[test]
    fn test_configuration_override_ignored() {
        let declared = ProcessConfig::default();
        let overrides = launch_overrides(&declared);
        let check = evaluate_configuration(
            &declared,
            &output("RUST_LOG=info\nRUST_BACKTRACE=1\n"),
            &overrides,
            &output("RUST_LOG=info\nRUST_BACKTRACE=1\n"),
        );
        assert!(!check.passed);
        assert!(check.detail.starts_with("launch overrides ignored"));
    }

    #[test]
    fn test_entrypoint() {
        let handoff = pipeline().handoff();
        let mut info = ImageInfo {
            entrypoint: vec!["/usr/local/bin/scoreboard".to_string()],
            ..Default::default()
        };
        assert!(evaluate_entrypoint(&info, &handoff).passed);

        info.cmd = vec!["--help".to_string()];
        assert!(!evaluate_entrypoint(&info, &handoff).passed);

        info.cmd.clear();
        info.entrypoint = vec!["/bin/sh".to_string(), "-c".to_string()];
        assert!(!evaluate_entrypoint(&info, &handoff).passed);
    }

    #[test]
    fn test_probe_scripts_mention_their_targets() {
        let handoff = pipeline().handoff();
        let script = artifact_script(&handoff);
        assert!(script.contains("-name 'scoreboard'"));
        assert!(script.contains("[ -x '/usr/local/bin/scoreboard' ]"));

        let script = toolchain_script();
        assert!(script.contains("cargo rustc cc gcc ld"));
        assert!(script.contains("/usr/local/cargo"));
    }
}
