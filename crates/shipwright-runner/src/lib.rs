//! Pipeline execution for Shipwright.
//!
//! Runs the Build Stage and the Release Stage in order against an image
//! builder, verifies the produced image and publishes it.

pub mod orchestrator;
pub mod publish;
pub mod verify;

pub use orchestrator::{PipelineEvent, PipelineOrchestrator, PipelineResult, RunOptions};
pub use publish::{PublishPlan, RunRefs, plan_publish};
pub use verify::Verifier;
