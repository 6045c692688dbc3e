//! Image references and publish planning.

use shipwright_config::VariableContext;
use shipwright_core::pipeline::ReleasePipeline;
use shipwright_core::{Error, ResourceId, Result};
use std::collections::BTreeMap;

/// Label carrying the commit the image was built from.
pub const REVISION_LABEL: &str = "org.opencontainers.image.revision";

/// Label carrying the digest of the packed source tree.
pub const SOURCE_DIGEST_LABEL: &str = "dev.shipwright.source-digest";

/// Label carrying the run that built an image.
pub const RUN_LABEL: &str = "dev.shipwright.run";

/// Run-scoped image references. Concurrent runs never share one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRefs {
    /// Image of the Build Stage, removed after the run.
    pub builder: String,
    /// Image of the Release Stage before it is tagged.
    pub release: String,
}

impl RunRefs {
    pub fn new(pipeline: &ReleasePipeline, run_id: &ResourceId) -> Self {
        let repo = repository_name(&pipeline.name);
        Self {
            builder: format!("shipwright-{}-builder:{}", repo, run_id),
            release: format!("shipwright-{}:{}", repo, run_id),
        }
    }
}

/// Docker repository names are lowercase with a restricted alphabet.
fn repository_name(name: &str) -> String {
    name.chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '.' | '_' | '-') => c,
            _ => '-',
        })
        .collect()
}

/// Tags and labels for a finished image, fully interpolated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishPlan {
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Interpolate the pipeline's tags and labels and add the provenance labels.
///
/// Fails when a tag or label refers to a variable the context cannot
/// resolve, or a tag resolves to an empty tag part.
pub fn plan_publish(pipeline: &ReleasePipeline, ctx: &VariableContext) -> Result<PublishPlan> {
    let mut unresolved = Vec::new();
    for value in pipeline
        .publish
        .tags
        .iter()
        .chain(pipeline.publish.labels.values())
    {
        unresolved.extend(ctx.unresolved(value));
    }
    if !unresolved.is_empty() {
        unresolved.sort();
        unresolved.dedup();
        return Err(Error::InvalidInput(format!(
            "unresolved variables in publish block: {}",
            unresolved.join(", ")
        )));
    }

    let tags = ctx.interpolate_vec(&pipeline.publish.tags);
    for tag in &tags {
        check_reference(tag)?;
    }

    let mut labels = ctx.interpolate_map(&pipeline.publish.labels);
    if !ctx.git.sha.is_empty() {
        labels
            .entry(REVISION_LABEL.to_string())
            .or_insert_with(|| ctx.git.sha.clone());
    }
    if !ctx.source_digest.is_empty() {
        labels.insert(SOURCE_DIGEST_LABEL.to_string(), ctx.source_digest.clone());
    }

    Ok(PublishPlan { tags, labels })
}

fn check_reference(reference: &str) -> Result<()> {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    let name = &reference[name_start..];
    let empty_part = name.is_empty()
        || name.starts_with(':')
        || name.ends_with(':')
        || reference.chars().any(char::is_whitespace);
    if empty_part {
        return Err(Error::InvalidInput(format!(
            "'{}' is not a valid image reference",
            reference
        )));
    }
    Ok(())
}
