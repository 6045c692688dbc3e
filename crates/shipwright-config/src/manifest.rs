//! Cargo manifest inspection.
//!
//! Works out which executables a source tree builds so the declared artifact
//! name can be checked before the Build Stage runs.

use crate::{ConfigError, ConfigResult};
use shipwright_core::pipeline::ReleasePipeline;
use std::collections::BTreeSet;
use std::path::Path;
use toml::Table;
use tracing::debug;

/// Check the pipeline's artifact is one of the binaries the source tree builds.
pub fn check_artifact(pipeline: &ReleasePipeline, source_dir: &Path) -> ConfigResult<()> {
    let binaries = binary_names(source_dir)?;
    if binaries.contains(&pipeline.artifact) {
        debug!(artifact = %pipeline.artifact, "Artifact matches a binary target");
        return Ok(());
    }
    Err(ConfigError::ArtifactMismatch {
        artifact: pipeline.artifact.clone(),
        available: binaries.into_iter().collect(),
    })
}

/// All binary target names built from the manifest in `source_dir`,
/// including workspace members.
pub fn binary_names(source_dir: &Path) -> ConfigResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    collect_binaries(source_dir, true, &mut names)?;
    Ok(names)
}

fn read_manifest(dir: &Path) -> ConfigResult<Table> {
    let path = dir.join("Cargo.toml");
    let content = std::fs::read_to_string(&path)?;
    content.parse::<Table>().map_err(|source| ConfigError::Manifest {
        path: path.display().to_string(),
        source,
    })
}

fn collect_binaries(dir: &Path, root: bool, names: &mut BTreeSet<String>) -> ConfigResult<()> {
    let manifest = read_manifest(dir)?;

    if let Some(package) = manifest.get("package").and_then(|p| p.as_table()) {
        collect_package_binaries(dir, package, &manifest, names);
    }

    // Nested workspaces are not followed.
    if root {
        if let Some(workspace) = manifest.get("workspace").and_then(|w| w.as_table()) {
            for member in workspace_members(dir, workspace)? {
                collect_binaries(&dir.join(member), false, names)?;
            }
        }
    }

    Ok(())
}

fn collect_package_binaries(
    dir: &Path,
    package: &Table,
    manifest: &Table,
    names: &mut BTreeSet<String>,
) {
    let package_name = package.get("name").and_then(|n| n.as_str());

    if let Some(bins) = manifest.get("bin").and_then(|b| b.as_array()) {
        for bin in bins {
            let name = bin
                .get("name")
                .and_then(|n| n.as_str())
                .or(package_name);
            if let Some(name) = name {
                names.insert(name.to_string());
            }
        }
    }

    let autobins = package
        .get("autobins")
        .and_then(|a| a.as_bool())
        .unwrap_or(true);
    if !autobins {
        return;
    }

    if let Some(name) = package_name {
        if dir.join("src/main.rs").is_file() {
            names.insert(name.to_string());
        }
    }

    let Ok(entries) = std::fs::read_dir(dir.join("src/bin")) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "rs") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.insert(stem.to_string());
            }
        } else if path.join("main.rs").is_file() {
            if let Some(dir_name) = path.file_name().and_then(|s| s.to_str()) {
                names.insert(dir_name.to_string());
            }
        }
    }
}

/// Member paths relative to the workspace root. Only a trailing `/*` glob
/// is expanded.
fn workspace_members(root: &Path, workspace: &Table) -> ConfigResult<Vec<String>> {
    let mut members = Vec::new();
    let Some(entries) = workspace.get("members").and_then(|m| m.as_array()) else {
        return Ok(members);
    };

    for entry in entries.iter().filter_map(|e| e.as_str()) {
        if let Some(parent) = entry.strip_suffix("/*") {
            let Ok(children) = std::fs::read_dir(root.join(parent)) else {
                continue;
            };
            let mut expanded: Vec<String> = children
                .flatten()
                .filter(|c| c.path().join("Cargo.toml").is_file())
                .filter_map(|c| c.file_name().to_str().map(|n| format!("{}/{}", parent, n)))
                .collect();
            expanded.sort();
            members.extend(expanded);
        } else if root.join(entry).join("Cargo.toml").is_file() {
            members.push(entry.to_string());
        }
    }

    Ok(members)
}
