//! Verification of an existing image.

use anyhow::Result;
use shipwright_core::verify::VerificationReport;
use shipwright_runner::Verifier;
use std::path::Path;

/// Run the verification probes for the pipeline at `config_path` against `image`.
pub async fn run(image: &str, config_path: &Path, docker_host: Option<&str>) -> Result<()> {
    let pipeline = super::load(config_path)?;
    let builder = super::connect(docker_host, None).await?;

    let report = Verifier::new(builder, pipeline).verify(image).await?;
    println!("Verifying {}", report.image);
    print_report(&report);

    if report.passed() {
        println!("\n✓ Image verified");
        Ok(())
    } else {
        anyhow::bail!("Verification failed: {}", report.summary());
    }
}

pub fn print_report(report: &VerificationReport) {
    for check in &report.checks {
        let marker = if check.passed { "✓" } else { "✗" };
        println!("  {} {} - {}", marker, check.name, check.detail);
    }
}
