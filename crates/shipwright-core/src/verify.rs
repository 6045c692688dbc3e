//! Verification report types.

use serde::{Deserialize, Serialize};

/// Outcome of one verification check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Check name (e.g., "toolchain-absent").
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckOutcome {
    pub fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: detail.into(),
        }
    }
}

/// All checks run against one image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub image: String,
    pub checks: Vec<CheckOutcome>,
}

impl VerificationReport {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            checks: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: CheckOutcome) {
        self.checks.push(outcome);
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// One line per failed check.
    pub fn summary(&self) -> String {
        self.failures()
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
