//! Pipeline definition parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use shipwright_core::pipeline::{
    BuildStage, PublishSpec, ReleasePipeline, ReleaseStage, RuntimeBase, RuntimeDependencySet,
    SourceTree, Toolchain,
};
use shipwright_core::process::{BACKTRACE_VAR, LOG_LEVEL_VAR, ProcessConfig};
use std::path::Path;
use tracing::debug;

/// Read, parse and validate a pipeline definition file.
///
/// A relative source path is resolved against the directory containing the
/// file.
pub fn load_pipeline(path: &Path) -> ConfigResult<ReleasePipeline> {
    let content = std::fs::read_to_string(path)?;
    let mut pipeline = parse_pipeline(&content)?;

    if pipeline.build.source.path.is_relative() {
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        pipeline.build.source.path = base.join(&pipeline.build.source.path);
    }

    debug!(path = %path.display(), pipeline = %pipeline.name, "Loaded pipeline definition");
    Ok(pipeline)
}

/// Parse and validate a pipeline definition from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<ReleasePipeline> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name: Option<String> = None;
    let mut artifact: Option<String> = None;
    let mut build: Option<BuildStage> = None;
    let mut release: Option<ReleaseStage> = None;
    let mut publish: Option<PublishSpec> = None;

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                let value = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
                set_once(&mut name, value, "pipeline")?;
            }
            "artifact" => {
                let value = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("artifact name".to_string()))?;
                set_once(&mut artifact, value, "artifact")?;
            }
            "build" => {
                if release.is_some() {
                    return Err(ConfigError::InvalidValue {
                        field: "build".to_string(),
                        message: "the build stage must be declared before the release stage"
                            .to_string(),
                    });
                }
                set_once(&mut build, parse_build(node)?, "build")?;
            }
            "release" => {
                set_once(&mut release, parse_release(node)?, "release")?;
            }
            "publish" => {
                set_once(&mut publish, parse_publish(node)?, "publish")?;
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let name = name.ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
    let artifact =
        artifact.ok_or_else(|| ConfigError::MissingField("artifact name".to_string()))?;
    let build = build.ok_or_else(|| ConfigError::MissingField("build stage".to_string()))?;
    let release =
        release.ok_or_else(|| ConfigError::MissingField("release stage".to_string()))?;

    let mut publish = publish.unwrap_or_default();
    if publish.tags.is_empty() {
        publish.tags.push(format!("{}:latest", name));
    }

    let pipeline = ReleasePipeline {
        name,
        artifact,
        build,
        release,
        publish,
    };

    crate::validate_pipeline(&pipeline)?;
    Ok(pipeline)
}

fn set_once<T>(slot: &mut Option<T>, value: T, what: &str) -> ConfigResult<()> {
    if slot.is_some() {
        return Err(ConfigError::Duplicate(what.to_string()));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_build(node: &KdlNode) -> ConfigResult<BuildStage> {
    let mut stage = BuildStage::default();
    let mut toolchain_seen = false;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "toolchain" => {
                    let image = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("toolchain image".to_string()))?;
                    let channel = get_string_prop(child, "channel")
                        .unwrap_or_else(|| Toolchain::default().channel);
                    stage.toolchain = Toolchain { image, channel };
                    toolchain_seen = true;
                }
                "workdir" => {
                    stage.workdir = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("workdir path".to_string()))?;
                }
                "source" => {
                    let path = get_first_string_arg(child).unwrap_or_else(|| ".".to_string());
                    stage.source = SourceTree {
                        path: path.into(),
                        exclude: get_string_list_prop(child, "exclude"),
                    };
                }
                "profile" => {
                    stage.profile = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("profile name".to_string()))?;
                }
                "locked" => {
                    stage.locked = get_first_bool_arg(child).unwrap_or(true);
                }
                "features" => {
                    stage.features.extend(get_all_string_args(child));
                }
                _ => {}
            }
        }
    }

    if !toolchain_seen {
        debug!(toolchain = %stage.toolchain.reference(), "No toolchain declared, using default");
    }

    Ok(stage)
}

fn parse_release(node: &KdlNode) -> ConfigResult<ReleaseStage> {
    let mut stage = ReleaseStage::default();
    let mut packages: Option<Vec<String>> = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "base" => {
                    let image = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("base image".to_string()))?;
                    let release = get_string_prop(child, "release")
                        .unwrap_or_else(|| RuntimeBase::default().release);
                    stage.base = RuntimeBase { image, release };
                }
                "install" => {
                    packages
                        .get_or_insert_with(Vec::new)
                        .extend(get_all_string_args(child));
                }
                "destination" => {
                    stage.destination = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField("destination path".to_string())
                    })?;
                }
                "env" => {
                    stage.process = parse_process_env(child)?;
                }
                _ => {}
            }
        }
    }

    if let Some(packages) = packages {
        stage.dependencies = RuntimeDependencySet::new(packages);
    }

    Ok(stage)
}

fn parse_process_env(node: &KdlNode) -> ConfigResult<ProcessConfig> {
    let mut config = ProcessConfig::default();

    let Some(children) = node.children() else {
        return Ok(config);
    };

    for child in children.nodes() {
        let key = child.name().value();
        match key {
            "log-level" | LOG_LEVEL_VAR => {
                let value = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("log-level value".to_string()))?;
                config.log_level = value.parse().map_err(|e: shipwright_core::Error| {
                    ConfigError::InvalidValue {
                        field: "log-level".to_string(),
                        message: e.to_string(),
                    }
                })?;
            }
            "backtrace" | BACKTRACE_VAR => {
                config.backtrace = first_arg(child)
                    .and_then(value_as_flag)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        field: "backtrace".to_string(),
                        message: "expected #true, #false, 0 or 1".to_string(),
                    })?;
            }
            _ => {
                let value = first_arg(child)
                    .map(value_to_string)
                    .ok_or_else(|| ConfigError::MissingField(format!("value for env {}", key)))?;
                if config.extra.insert(key.to_string(), value).is_some() {
                    return Err(ConfigError::Duplicate(format!("env {}", key)));
                }
            }
        }
    }

    Ok(config)
}

fn parse_publish(node: &KdlNode) -> ConfigResult<PublishSpec> {
    let mut spec = PublishSpec::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "tag" => {
                    spec.tags.extend(get_all_string_args(child));
                }
                "label" => {
                    let args = get_all_string_args(child);
                    match args.as_slice() {
                        [key, value] => {
                            spec.labels.insert(key.clone(), value.clone());
                        }
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                field: "label".to_string(),
                                message: "expected a key and a value".to_string(),
                            });
                        }
                    }
                }
                "push" => {
                    spec.push = get_first_bool_arg(child).unwrap_or(true);
                }
                _ => {}
            }
        }
    }

    Ok(spec)
}

// Helper functions for extracting values from KDL nodes

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    first_arg(node).and_then(|v| v.as_bool())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated properties, e.g. exclude="target" exclude=".git"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                result.extend(get_all_string_args(child));
            }
        }
    }

    result
}

fn value_as_flag(value: &KdlValue) -> Option<bool> {
    if let Some(b) = value.as_bool() {
        return Some(b);
    }
    if let Some(i) = value.as_integer() {
        return Some(i != 0);
    }
    match value.as_string()? {
        "1" | "true" | "full" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn value_to_string(value: &KdlValue) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string();
    }
    if let Some(b) = value.as_bool() {
        return b.to_string();
    }
    if let Some(i) = value.as_integer() {
        return i.to_string();
    }
    if let Some(f) = value.as_float() {
        return f.to_string();
    }
    String::new()
}
