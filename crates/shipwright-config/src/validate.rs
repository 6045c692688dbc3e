//! Definition-time validation.
//!
//! Everything here is checked before any image work starts, so a bad
//! definition never reaches the container engine.

use crate::{ConfigError, ConfigResult};
use regex::Regex;
use shipwright_core::pipeline::ReleasePipeline;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Packages that would bring a compiler or linker into the runtime image.
const BUILD_TOOLING: &[&str] = &[
    "binutils",
    "build-essential",
    "cargo",
    "cc",
    "clang",
    "g++",
    "gcc",
    "make",
    "rustc",
];

// Docker repository path component, matched case-insensitively since run
// references lowercase the name.
static PIPELINE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]+(?:(?:[._]|__|-+)[A-Za-z0-9]+)*$").unwrap()
});

// Debian policy: lowercase alphanumerics, + - . and at least two characters.
static PACKAGE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9+.\-]+$").unwrap());

/// Validate a parsed pipeline definition.
pub fn validate_pipeline(pipeline: &ReleasePipeline) -> ConfigResult<()> {
    if pipeline.name.trim().is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }
    if !PIPELINE_NAME.is_match(&pipeline.name) {
        return Err(ConfigError::InvalidValue {
            field: "pipeline".to_string(),
            message: format!(
                "'{}' must be alphanumerics joined by '.', '_' or '-'",
                pipeline.name
            ),
        });
    }

    validate_artifact_name(&pipeline.artifact)?;

    let build = &pipeline.build;
    if build.toolchain.image.is_empty() || build.toolchain.channel.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "toolchain".to_string(),
            message: "image and channel must both be set".to_string(),
        });
    }
    if !build.workdir.starts_with('/') {
        return Err(ConfigError::InvalidValue {
            field: "workdir".to_string(),
            message: format!("'{}' is not an absolute path", build.workdir),
        });
    }
    if !build.is_optimized() {
        return Err(ConfigError::InvalidValue {
            field: "profile".to_string(),
            message: format!("'{}' does not produce an optimized artifact", build.profile),
        });
    }
    for (declared, path) in build.source.exclude.iter().zip(build.source.exclusions()) {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|c| c == "..") {
            return Err(ConfigError::InvalidValue {
                field: "exclude".to_string(),
                message: format!("'{}' must be a relative path inside the source tree", declared),
            });
        }
        if path.contains(['*', '?', '[', ']', '!', '\\']) {
            return Err(ConfigError::InvalidValue {
                field: "exclude".to_string(),
                message: format!("'{}' is a pattern; only literal paths are supported", declared),
            });
        }
    }

    let release = &pipeline.release;
    if release.base.image.is_empty() || release.base.release.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "base".to_string(),
            message: "image and release must both be set".to_string(),
        });
    }
    if release.base.image == build.toolchain.image {
        return Err(ConfigError::InvalidReference(format!(
            "release base '{}' is the toolchain image; the runtime environment must not carry the toolchain",
            release.base.reference()
        )));
    }
    if !release.destination.starts_with('/') {
        return Err(ConfigError::InvalidValue {
            field: "destination".to_string(),
            message: format!("'{}' is not an absolute path", release.destination),
        });
    }

    validate_dependencies(release.dependencies.packages())?;

    for (key, value) in &release.process.extra {
        if key.is_empty() || key.contains('=') || key.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                field: "env".to_string(),
                message: format!("'{}' is not a valid variable name", key),
            });
        }
        if value.contains(char::is_control) {
            return Err(ConfigError::InvalidValue {
                field: "env".to_string(),
                message: format!("value of {} contains control characters", key),
            });
        }
    }

    for tag in &pipeline.publish.tags {
        if tag.trim().is_empty() || tag.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                field: "tag".to_string(),
                message: format!("'{}' is not a valid image reference", tag),
            });
        }
    }

    Ok(())
}

fn validate_artifact_name(name: &str) -> ConfigResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ConfigError::InvalidValue {
            field: "artifact".to_string(),
            message: format!("'{}' is not a valid file name", name),
        });
    }
    Ok(())
}

fn validate_dependencies(packages: &[String]) -> ConfigResult<()> {
    if packages.is_empty() {
        return Err(ConfigError::MissingField(
            "runtime dependencies (install)".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for package in packages {
        if !PACKAGE_NAME.is_match(package) {
            return Err(ConfigError::InvalidValue {
                field: "install".to_string(),
                message: format!("'{}' is not a valid package name", package),
            });
        }
        if BUILD_TOOLING.contains(&package.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "install".to_string(),
                message: format!("'{}' is build tooling and must not be installed at runtime", package),
            });
        }
        if !seen.insert(package.as_str()) {
            return Err(ConfigError::Duplicate(format!("runtime dependency {}", package)));
        }
    }

    Ok(())
}
