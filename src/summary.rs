//! Run summary and digest
//!
//! One [`TargetReport`] per platform target, keyed in a stable order. The
//! orchestrator fills it in as targets finish; afterwards it is read-only.

use crate::lifecycle::{LifecycleState, PipelineMode, TargetLifecycle};
use crate::platform::PlatformTarget;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Exit code when every requested target reached its success state
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when at least one target failed
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for a malformed invocation (unknown target, bad config)
pub const EXIT_USAGE: i32 = 2;

/// Outcome for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    /// Terminal lifecycle state
    pub state: LifecycleState,
    /// Built executables
    pub artifacts: Vec<PathBuf>,
    /// Produced package, if packaging succeeded
    pub package: Option<PathBuf>,
}

impl TargetReport {
    /// Report for a target that produced nothing, in the lifecycle's state
    pub fn without_outputs(lifecycle: &TargetLifecycle) -> Self {
        Self {
            state: lifecycle.current().clone(),
            artifacts: Vec::new(),
            package: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.state, LifecycleState::Skipped { .. })
    }
}

/// Per-target outcomes of one run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunSummary {
    mode: PipelineMode,
    targets: BTreeMap<PlatformTarget, TargetReport>,
    /// Skips that name no target (host matched no supported family)
    notes: Vec<String>,
}

impl RunSummary {
    pub fn new(mode: PipelineMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn record(&mut self, target: PlatformTarget, report: TargetReport) {
        self.targets.insert(target, report);
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }

    pub fn get(&self, target: PlatformTarget) -> Option<&TargetReport> {
        self.targets.get(&target)
    }

    /// Terminal state of `target`, if it was part of the run
    pub fn state(&self, target: PlatformTarget) -> Option<&LifecycleState> {
        self.get(target).map(|report| &report.state)
    }

    pub fn targets(&self) -> impl Iterator<Item = (PlatformTarget, &TargetReport)> {
        self.targets.iter().map(|(target, report)| (*target, report))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// True iff every non-skipped target reached its success state
    pub fn is_success(&self) -> bool {
        self.targets
            .values()
            .filter(|report| !report.is_skipped())
            .all(|report| report.state.is_success(self.mode))
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { EXIT_SUCCESS } else { EXIT_FAILURE }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Deployment summary:")?;
        for note in &self.notes {
            writeln!(f, "  note: {}", note)?;
        }
        for (target, report) in &self.targets {
            match &report.state {
                LifecycleState::Failed { stage, reason } => {
                    writeln!(f, "  {:<8} FAILED at {}: {}", target.to_string(), stage, reason)?
                }
                LifecycleState::Skipped { reason } => {
                    writeln!(f, "  {:<8} skipped ({})", target.to_string(), reason)?
                }
                state => writeln!(f, "  {:<8} {}", target.to_string(), state)?,
            }
            for artifact in &report.artifacts {
                writeln!(f, "           built    {}", artifact.display())?;
            }
            if let Some(package) = &report.package {
                writeln!(f, "           package  {}", package.display())?;
            }
        }
        write!(f, "Result: {}", if self.is_success() { "success" } else { "FAILED" })
    }
}
