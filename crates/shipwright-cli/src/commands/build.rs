//! Local pipeline execution command.

use anyhow::{Context, Result};
use shipwright_config::VariableContext;
use shipwright_core::builder::LogStream;
use shipwright_core::pipeline::StageStatus;
use shipwright_runner::{PipelineEvent, PipelineOrchestrator, RunOptions};
use std::path::Path;

use super::RegistryLogin;

/// Parse a `NAME=VALUE` tag variable.
pub fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(format!("'{}' is not a valid variable name", name));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Build, verify and publish the pipeline's release image.
pub async fn run(
    config_path: &Path,
    docker_host: Option<&str>,
    login: Option<RegistryLogin>,
    options: RunOptions,
    vars: &[(String, String)],
    json: bool,
) -> Result<()> {
    let pipeline = super::load(config_path)?;
    let builder = super::connect(docker_host, login).await?;

    let mut var_ctx = VariableContext::new();
    var_ctx.populate_env();
    var_ctx.populate_git_from_env();
    if var_ctx.git.sha.is_empty() {
        var_ctx.populate_git_from_repo(&pipeline.build.source.path);
    }
    for (name, value) in vars {
        var_ctx.set(name, value.as_str());
    }

    if !json {
        println!("Running pipeline: {}", pipeline.name);
        println!("Source: {}", pipeline.build.source.path.display());
        println!("\n--- Starting pipeline execution ---\n");
    }

    let orchestrator = PipelineOrchestrator::with_options(builder, options);
    let (mut rx, result_handle) = orchestrator.execute(&pipeline, var_ctx);

    while let Some(event) = rx.recv().await {
        if !json {
            print_event(event);
        }
    }

    let result = result_handle
        .await
        .context("Pipeline execution task failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("\n--- Stage Summary ---");
        for stage in &result.stages {
            let status = match &stage.status {
                StageStatus::Succeeded => "✓ succeeded".to_string(),
                StageStatus::Failed { message } => format!("✗ failed: {}", message),
                StageStatus::Skipped { reason } => format!("⊘ skipped: {}", reason),
                StageStatus::Pending => "○ pending".to_string(),
                StageStatus::Running => "▶ running".to_string(),
            };
            println!("  {} - {}", stage.stage, status);
        }
        if let Some(digest) = &result.source_digest {
            println!("  source digest: {}", digest);
        }
    }

    match result.error {
        None => {
            if !json {
                println!("\n✓ Pipeline succeeded!");
            }
            Ok(())
        }
        Some(error) => anyhow::bail!("Pipeline failed: {}", error),
    }
}

fn print_event(event: PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { stage } => {
            println!("▶ Stage '{}' started", stage);
        }
        PipelineEvent::StepStarted {
            stage,
            index,
            total,
            operation,
            instruction,
        } => {
            let operation = operation
                .map(|op| format!(" ({})", op))
                .unwrap_or_default();
            println!("  [{}] step {}/{}{}: {}", stage, index, total, operation, instruction);
        }
        PipelineEvent::StageLog { stage, line } => {
            let stream_marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            println!("  [{}]{} {}", stage, stream_marker, line.content);
        }
        PipelineEvent::StageCompleted { stage, success } => {
            if success {
                println!("✓ Stage '{}' completed successfully\n", stage);
            } else {
                println!("✗ Stage '{}' failed\n", stage);
            }
        }
        PipelineEvent::VerificationCompleted { report } => {
            println!("--- Verification ---");
            super::verify::print_report(&report);
            println!();
        }
        PipelineEvent::Published { reference, pushed } => {
            if pushed {
                println!("⇪ Pushed {}", reference);
            } else {
                println!("✓ Tagged {}", reference);
            }
        }
        PipelineEvent::PipelineCompleted { success } => {
            if success {
                println!("--- Pipeline completed successfully ---");
            } else {
                println!("--- Pipeline failed ---");
            }
        }
    }
}
