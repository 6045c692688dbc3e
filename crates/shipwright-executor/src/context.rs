//! Build context packing.
//!
//! The source tree is packed into a tar archive together with the rendered
//! Dockerfile. Files are added in sorted order and the archive carries a
//! SHA-256 digest over the source files only, so an unchanged tree always
//! yields the same digest.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use shipwright_core::pipeline::SourceTree;
use shipwright_core::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::dockerfile::DOCKERFILE_NAME;

/// Directories that usually have no business in a build context.
const USUALLY_EXCLUDED: &[&str] = &[".git", "target"];

/// A packed build context.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Tar archive.
    pub archive: Bytes,
    /// Hex SHA-256 over the staged source files.
    pub digest: String,
    /// Number of source files staged.
    pub files: usize,
    /// Total size of staged source files in bytes.
    pub bytes: u64,
}

/// Pack `source` and the rendered Dockerfile into a build context.
pub fn pack_context(source: &SourceTree, dockerfile: &str) -> Result<BuildContext> {
    let root = &source.path;
    if !root.is_dir() {
        return Err(Error::NotFound(format!(
            "source tree {} is not a directory",
            root.display()
        )));
    }

    if source.exclude.is_empty() {
        for dir in USUALLY_EXCLUDED {
            if root.join(dir).exists() {
                warn!(
                    path = %root.join(dir).display(),
                    "Source tree is staged in full, including this directory; add it to the exclude list to leave it out"
                );
            }
        }
    }

    let excluded: Vec<PathBuf> = source.exclusions().into_iter().map(PathBuf::from).collect();

    let mut entries = Vec::new();
    walk(root, Path::new(""), &excluded, &mut entries).map_err(io_error)?;

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    let mut hasher = Sha256::new();
    let mut files = 0;
    let mut bytes = 0;

    for rel in &entries {
        let full = root.join(rel);
        let meta = fs::symlink_metadata(&full).map_err(io_error)?;

        if meta.is_dir() {
            builder.append_dir(rel, &full).map_err(io_error)?;
            continue;
        }

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&full).map_err(io_error)?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else {
            hasher.update(fs::read(&full).map_err(io_error)?);
            bytes += meta.len();
        }
        hasher.update([0u8]);
        files += 1;

        builder.append_path_with_name(&full, rel).map_err(io_error)?;
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder
        .append_data(&mut header, DOCKERFILE_NAME, dockerfile.as_bytes())
        .map_err(io_error)?;

    let archive = builder.into_inner().map_err(io_error)?;
    let digest = hex::encode(hasher.finalize());

    info!(
        source = %root.display(),
        files,
        bytes,
        digest = %digest,
        "Packed build context"
    );

    Ok(BuildContext {
        archive: Bytes::from(archive),
        digest,
        files,
        bytes,
    })
}

/// Collect paths relative to `root`, directories before their contents,
/// siblings sorted by name.
fn walk(
    root: &Path,
    rel: &Path,
    excluded: &[PathBuf],
    out: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    let mut children: Vec<_> = fs::read_dir(root.join(rel))?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.file_name())
        .collect();
    children.sort();

    for name in children {
        let child = rel.join(&name);
        if excluded.iter().any(|ex| child.starts_with(ex)) {
            debug!(path = %child.display(), "Excluded from build context");
            continue;
        }
        // The rendered Dockerfile always wins over a file of the same name.
        if rel.as_os_str().is_empty() && name == DOCKERFILE_NAME {
            continue;
        }

        let file_type = fs::symlink_metadata(root.join(&child))?.file_type();
        out.push(child.clone());
        if file_type.is_dir() {
            walk(root, &child, excluded, out)?;
        }
    }

    Ok(())
}

fn io_error(e: std::io::Error) -> Error {
    Error::Internal(format!("failed to pack build context: {}", e))
}
