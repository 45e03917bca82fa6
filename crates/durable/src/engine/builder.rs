//! Workflow builder
//!
//! Computes the ordered step plan for a subject's launch mode. The plan is fixed
//! when the workflow row is created and never recomputed afterwards.

use graduation_core::{LaunchMode, Step, StepKind};

/// Step kinds, in execution order, for a launch mode.
pub fn step_plan(mode: LaunchMode) -> Vec<StepKind> {
    let mut plan = vec![StepKind::CreateMetadata, StepKind::DeployWallet];
    if mode.requires_token() {
        plan.push(StepKind::DeployToken);
    }
    plan.extend([
        StepKind::RegisterOnLedger,
        StepKind::ConfigureSubject,
        StepKind::ActivateSubject,
    ]);
    plan
}

/// Fresh pending steps for a launch mode.
pub fn build_steps(mode: LaunchMode) -> Vec<Step> {
    step_plan(mode).into_iter().map(Step::new).collect()
}
