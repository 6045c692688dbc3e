//! Variable interpolation for image tags and labels.
//!
//! Supports variables like:
//! - `${git.sha}` - Full git commit SHA
//! - `${git.short_sha}` - Short (7 char) git commit SHA
//! - `${git.branch}` - Current branch name
//! - `${git.tag}` - Git tag (if applicable)
//! - `${git.ref}` - Git ref (tag if present, else branch)
//! - `${pipeline.name}` - Pipeline name
//! - `${artifact.name}` - Artifact name
//! - `${toolchain.channel}` - Toolchain channel
//! - `${run.id}` - Run ID
//! - `${source.digest}` - SHA-256 of the packed source tree
//! - `${env.VAR_NAME}` - Environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${NAME}` - Caller-defined variable

use regex::Regex;
use shipwright_core::pipeline::ReleasePipeline;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub pipeline: PipelineContext,
    pub run_id: String,
    pub source_digest: String,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Custom variables defined by the caller
    pub custom: HashMap<String, String>,
}

/// Git context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub tag: Option<String>,
    pub ref_name: String,
}

/// Pipeline context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub name: String,
    pub artifact: String,
    pub toolchain_channel: String,
}

impl From<&ReleasePipeline> for PipelineContext {
    fn from(pipeline: &ReleasePipeline) -> Self {
        Self {
            name: pipeline.name.clone(),
            artifact: pipeline.artifact.clone(),
            toolchain_channel: pipeline.build.toolchain.channel.clone(),
        }
    }
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate git context from CI environment variables.
    pub fn populate_git_from_env(&mut self) {
        self.git.sha = std::env::var("SHIPWRIGHT_COMMIT_SHA")
            .or_else(|_| std::env::var("GIT_COMMIT"))
            .or_else(|_| std::env::var("GITHUB_SHA"))
            .or_else(|_| std::env::var("CI_COMMIT_SHA"))
            .unwrap_or_default();

        if !self.git.sha.is_empty() {
            self.git.short_sha = self.git.sha.chars().take(7).collect();
        }

        self.git.branch = std::env::var("SHIPWRIGHT_BRANCH")
            .or_else(|_| std::env::var("GIT_BRANCH"))
            .or_else(|_| std::env::var("GITHUB_REF_NAME"))
            .or_else(|_| std::env::var("CI_COMMIT_BRANCH"))
            .unwrap_or_default();

        self.git.tag = std::env::var("SHIPWRIGHT_TAG")
            .or_else(|_| std::env::var("CI_COMMIT_TAG"))
            .ok()
            .or_else(|| {
                std::env::var("GITHUB_REF_TYPE")
                    .ok()
                    .filter(|t| t == "tag")
                    .and_then(|_| std::env::var("GITHUB_REF_NAME").ok())
            });

        self.git.ref_name = self
            .git
            .tag
            .clone()
            .unwrap_or_else(|| self.git.branch.clone());
    }

    /// Populate git context by running git in a repository path. Fields git
    /// cannot answer are left as they are.
    pub fn populate_git_from_repo(&mut self, repo_path: &std::path::Path) {
        use std::process::Command;

        let run_git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(repo_path)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        };

        if let Some(sha) = run_git(&["rev-parse", "HEAD"]) {
            self.git.short_sha = sha.chars().take(7).collect();
            self.git.sha = sha;
        }

        if let Some(branch) = run_git(&["rev-parse", "--abbrev-ref", "HEAD"]) {
            if branch != "HEAD" {
                self.git.ref_name = branch.clone();
                self.git.branch = branch;
            }
        }

        if let Some(tag) = run_git(&["describe", "--tags", "--exact-match", "HEAD"]) {
            self.git.ref_name = tag.clone();
            self.git.tag = Some(tag);
        }
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),
            ["git", "tag"] => self.git.tag.clone(),
            ["git", "ref"] => Some(self.git.ref_name.clone()),

            ["pipeline", "name"] => Some(self.pipeline.name.clone()),
            ["artifact", "name"] => Some(self.pipeline.artifact.clone()),
            ["toolchain", "channel"] => Some(self.pipeline.toolchain_channel.clone()),

            ["run", "id"] => Some(self.run_id.clone()),
            ["source", "digest"] => Some(self.source_digest.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),

            // Single-part names check custom variables
            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left
    /// untouched.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a list of strings.
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Interpolate the values of a map.
    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Variable names in `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        if self.ctx.git.ref_name.is_empty() {
            self.ctx.git.ref_name = branch.clone();
        }
        self.ctx.git.branch = branch;
        self
    }

    pub fn with_git_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.ctx.git.ref_name = tag.clone();
        self.ctx.git.tag = Some(tag);
        self
    }

    pub fn with_pipeline(mut self, pipeline: &ReleasePipeline) -> Self {
        self.ctx.pipeline = PipelineContext::from(pipeline);
        self
    }

    pub fn with_run_id(mut self, id: impl Into<String>) -> Self {
        self.ctx.run_id = id.into();
        self
    }

    pub fn with_source_digest(mut self, digest: impl Into<String>) -> Self {
        self.ctx.source_digest = digest.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_core::pipeline::{BuildStage, PublishSpec, ReleaseStage};

    #[test]
    fn test_git_interpolation() {
        let ctx = VariableContextBuilder::new()
            .with_git_sha("abc1234567890def")
            .with_git_branch("main")
            .build();

        assert_eq!(
            ctx.interpolate("scoreboard:${git.short_sha}-${git.branch}"),
            "scoreboard:abc1234-main"
        );
        assert_eq!(ctx.interpolate("${git.ref}"), "main");
    }

    #[test]
    fn test_tag_takes_over_ref() {
        let ctx = VariableContextBuilder::new()
            .with_git_branch("main")
            .with_git_tag("v1.4.0")
            .build();
        assert_eq!(ctx.interpolate("scoreboard:${git.ref}"), "scoreboard:v1.4.0");
    }

    #[test]
    fn test_pipeline_variables() {
        let pipeline = ReleasePipeline {
            name: "scoreboard".to_string(),
            artifact: "scoreboard-server".to_string(),
            build: BuildStage::default(),
            release: ReleaseStage::default(),
            publish: PublishSpec::default(),
        };
        let ctx = VariableContextBuilder::new()
            .with_pipeline(&pipeline)
            .with_run_id("0190abcd")
            .with_source_digest("e3b0c442")
            .build();

        assert_eq!(
            ctx.interpolate("${pipeline.name}/${artifact.name}:${toolchain.channel}-${run.id}"),
            "scoreboard/scoreboard-server:1.85-0190abcd"
        );
        assert_eq!(ctx.interpolate("${source.digest}"), "e3b0c442");
    }

    #[test]
    fn test_env_variables() {
        let ctx = VariableContextBuilder::new()
            .with_env("REGISTRY", "registry.example.com")
            .build();
        assert_eq!(
            ctx.interpolate("${env.REGISTRY}/scoreboard"),
            "registry.example.com/scoreboard"
        );
    }

    #[test]
    fn test_unknown_variable_preserved_and_reported() {
        let ctx = VariableContext::new();
        assert_eq!(ctx.interpolate("x:${unknown.var}"), "x:${unknown.var}");
        assert_eq!(ctx.unresolved("${unknown.var} ${git.sha}"), vec!["unknown.var"]);
    }

    #[test]
    fn test_missing_tag_is_unresolved() {
        let ctx = VariableContextBuilder::new().with_git_branch("main").build();
        assert_eq!(ctx.unresolved("scoreboard:${git.tag}"), vec!["git.tag"]);
    }

    #[test]
    fn test_interpolate_map() {
        let ctx = VariableContextBuilder::new().with_git_sha("abc123").build();
        let mut labels = BTreeMap::new();
        labels.insert(
            "org.opencontainers.image.revision".to_string(),
            "${git.sha}".to_string(),
        );
        let out = ctx.interpolate_map(&labels);
        assert_eq!(out["org.opencontainers.image.revision"], "abc123");
    }

    #[test]
    fn test_custom_and_date() {
        let mut ctx = VariableContext::new();
        ctx.set("version", "1.2.3");
        assert_eq!(ctx.interpolate("v${version}"), "v1.2.3");
        assert_eq!(ctx.interpolate("${date}").len(), 10);
    }
}
