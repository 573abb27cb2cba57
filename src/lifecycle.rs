//! Per-target lifecycle state machine
//!
//! Each platform target moves through a fixed, forward-only sequence of
//! states during one orchestration run. The [`TargetLifecycle`] owns the
//! current state and rejects any transition that would skip a state, go
//! backwards, or leave a terminal state.
//!
//! # State Flow
//!
//! ```text
//! Unbuilt
//!     ↓
//! Built
//!     ↓
//! Staged
//!     ↓
//! Provisioned      (full mode only)
//!     ↓
//! Packaged         (terminal success in package-only mode)
//!     ↓
//! Registered       (full mode only)
//!     ↓
//! Verified
//!
//! (Any non-terminal state can transition to Failed;
//!  only Unbuilt can transition to Skipped)
//! ```

use crate::error::StageFailure;
use std::fmt;
use thiserror::Error;

/// The unit of work whose failure is recorded in `Failed(stage, reason)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Build,
    Provision,
    Package,
    Register,
    Start,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Build => "Build",
            Self::Provision => "Provision",
            Self::Package => "Package",
            Self::Register => "Register",
            Self::Start => "Start",
        };
        f.write_str(name)
    }
}

/// How far a target's pipeline is meant to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineMode {
    /// Build, stage, provision, package, register and verify the service
    #[default]
    Full,
    /// Build, stage and package only; `Packaged` is the success state
    PackageOnly,
}

/// Where a target's deployment stands within one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Unbuilt,
    Built,
    Staged,
    Provisioned,
    Packaged,
    Registered,
    Verified,
    /// Terminal: the pipeline stopped at `stage`
    Failed { stage: Stage, reason: String },
    /// Terminal: the target does not apply to this host
    Skipped { reason: String },
}

impl LifecycleState {
    /// Short, stable name of the state
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Unbuilt => "Unbuilt",
            Self::Built => "Built",
            Self::Staged => "Staged",
            Self::Provisioned => "Provisioned",
            Self::Packaged => "Packaged",
            Self::Registered => "Registered",
            Self::Verified => "Verified",
            Self::Failed { .. } => "Failed",
            Self::Skipped { .. } => "Skipped",
        }
    }

    /// Returns true for states that end the target's pipeline in `mode`
    pub fn is_terminal(&self, mode: PipelineMode) -> bool {
        match self {
            Self::Verified | Self::Failed { .. } | Self::Skipped { .. } => true,
            Self::Packaged => mode == PipelineMode::PackageOnly,
            _ => false,
        }
    }

    /// Returns true if this is the success terminal state for `mode`
    pub fn is_success(&self, mode: PipelineMode) -> bool {
        match mode {
            PipelineMode::Full => matches!(self, Self::Verified),
            PipelineMode::PackageOnly => matches!(self, Self::Packaged),
        }
    }

    /// Returns the next state in the success path for `mode`, if any
    pub fn next(&self, mode: PipelineMode) -> Option<Self> {
        match (self, mode) {
            (Self::Unbuilt, _) => Some(Self::Built),
            (Self::Built, _) => Some(Self::Staged),
            (Self::Staged, PipelineMode::Full) => Some(Self::Provisioned),
            (Self::Staged, PipelineMode::PackageOnly) => Some(Self::Packaged),
            (Self::Provisioned, PipelineMode::Full) => Some(Self::Packaged),
            (Self::Packaged, PipelineMode::Full) => Some(Self::Registered),
            (Self::Registered, PipelineMode::Full) => Some(Self::Verified),
            _ => None,
        }
    }

    /// Position in the success path, used to tell backward from skipping
    const fn order(&self) -> u8 {
        match self {
            Self::Unbuilt => 0,
            Self::Built => 1,
            Self::Staged => 2,
            Self::Provisioned => 3,
            Self::Packaged => 4,
            Self::Registered => 5,
            Self::Verified => 6,
            Self::Failed { .. } | Self::Skipped { .. } => u8::MAX,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { stage, reason } => {
                write!(f, "Failed(stage={}, reason={})", stage, reason)
            }
            Self::Skipped { reason } => write!(f, "Skipped ({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// Attempted to skip one or more states
    #[error("Cannot skip from {from} to {to}")]
    SkippedState {
        from: &'static str,
        to: &'static str,
    },

    /// Attempted to go backwards
    #[error("Cannot go backwards from {from} to {to} (lifecycle is forward-only)")]
    BackwardTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Attempted to transition out of a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: &'static str },

    /// Skipped is only reachable before any work has started
    #[error("Cannot skip a target that already reached {from}")]
    SkipAfterStart { from: &'static str },
}

/// Lifecycle of one platform target within one run.
#[derive(Debug, Clone)]
pub struct TargetLifecycle {
    mode: PipelineMode,
    current: LifecycleState,
    history: Vec<LifecycleState>,
}

impl TargetLifecycle {
    /// Create a lifecycle in the `Unbuilt` state
    pub fn new(mode: PipelineMode) -> Self {
        Self {
            mode,
            current: LifecycleState::Unbuilt,
            history: vec![LifecycleState::Unbuilt],
        }
    }

    /// Returns the current state
    #[inline]
    pub fn current(&self) -> &LifecycleState {
        &self.current
    }

    /// Returns the pipeline mode this lifecycle validates against
    #[inline]
    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    /// Every state visited so far, oldest first
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    /// Returns true if the current state is terminal
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal(self.mode)
    }

    /// Returns true if the target reached its success terminal state
    #[inline]
    pub fn is_success(&self) -> bool {
        self.current.is_success(self.mode)
    }

    /// Move to `target`, which must be the immediate next success state.
    pub fn transition_to(&mut self, target: LifecycleState) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::FromTerminalState {
                from: self.current.label(),
            });
        }

        let expected = self.current.next(self.mode);
        if expected.as_ref() != Some(&target) {
            if target.order() <= self.current.order() {
                return Err(TransitionError::BackwardTransition {
                    from: self.current.label(),
                    to: target.label(),
                });
            }
            return Err(TransitionError::SkippedState {
                from: self.current.label(),
                to: target.label(),
            });
        }

        self.record(target);
        Ok(())
    }

    /// Record a fatal stage failure. Allowed from any non-terminal state.
    pub fn fail(&mut self, failure: &StageFailure) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::FromTerminalState {
                from: self.current.label(),
            });
        }
        self.record(LifecycleState::Failed {
            stage: failure.stage(),
            reason: failure.to_string(),
        });
        Ok(())
    }

    /// Mark the target as not applicable to this host.
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::FromTerminalState {
                from: self.current.label(),
            });
        }
        if self.current != LifecycleState::Unbuilt {
            return Err(TransitionError::SkipAfterStart {
                from: self.current.label(),
            });
        }
        self.record(LifecycleState::Skipped {
            reason: reason.into(),
        });
        Ok(())
    }

    fn record(&mut self, state: LifecycleState) {
        tracing::debug!("lifecycle: {} -> {}", self.current.label(), state.label());
        self.history.push(state.clone());
        self.current = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(lifecycle: &mut TargetLifecycle, states: &[LifecycleState]) {
        for state in states {
            lifecycle.transition_to(state.clone()).expect("valid transition");
        }
    }

    #[test]
    fn test_full_mode_walks_to_verified() {
        let mut lc = TargetLifecycle::new(PipelineMode::Full);
        walk(
            &mut lc,
            &[
                LifecycleState::Built,
                LifecycleState::Staged,
                LifecycleState::Provisioned,
                LifecycleState::Packaged,
                LifecycleState::Registered,
                LifecycleState::Verified,
            ],
        );
        assert!(lc.is_terminal());
        assert!(lc.is_success());
        assert_eq!(lc.history().len(), 7);
    }

    #[test]
    fn test_package_only_ends_at_packaged() {
        let mut lc = TargetLifecycle::new(PipelineMode::PackageOnly);
        walk(
            &mut lc,
            &[
                LifecycleState::Built,
                LifecycleState::Staged,
                LifecycleState::Packaged,
            ],
        );
        assert!(lc.is_terminal());
        assert!(lc.is_success());
        assert!(matches!(
            lc.transition_to(LifecycleState::Registered),
            Err(TransitionError::FromTerminalState { .. })
        ));
    }

    #[test]
    fn test_cannot_skip_states() {
        let mut lc = TargetLifecycle::new(PipelineMode::Full);
        let err = lc.transition_to(LifecycleState::Staged).unwrap_err();
        assert_eq!(
            err,
            TransitionError::SkippedState {
                from: "Unbuilt",
                to: "Staged"
            }
        );
    }

    #[test]
    fn test_cannot_go_backwards() {
        let mut lc = TargetLifecycle::new(PipelineMode::Full);
        walk(&mut lc, &[LifecycleState::Built, LifecycleState::Staged]);
        let err = lc.transition_to(LifecycleState::Built).unwrap_err();
        assert!(matches!(err, TransitionError::BackwardTransition { .. }));
        let err = lc.transition_to(LifecycleState::Staged).unwrap_err();
        assert!(matches!(err, TransitionError::BackwardTransition { .. }));
    }

    #[test]
    fn test_fail_from_any_non_terminal_state() {
        let mut lc = TargetLifecycle::new(PipelineMode::Full);
        walk(&mut lc, &[LifecycleState::Built]);
        lc.fail(&StageFailure::principal("useradd: permission denied"))
            .unwrap();
        assert_eq!(
            lc.current(),
            &LifecycleState::Failed {
                stage: Stage::Provision,
                reason: "provisioning failed (principal creation): useradd: permission denied"
                    .to_string(),
            }
        );
        assert!(!lc.is_success());
        assert!(lc.fail(&StageFailure::Build("again".into())).is_err());
    }

    #[test]
    fn test_skip_only_before_work_starts() {
        let mut lc = TargetLifecycle::new(PipelineMode::Full);
        lc.skip("host is linux").unwrap();
        assert!(lc.is_terminal());
        assert!(!lc.is_success());

        let mut lc = TargetLifecycle::new(PipelineMode::Full);
        walk(&mut lc, &[LifecycleState::Built]);
        assert_eq!(
            lc.skip("late").unwrap_err(),
            TransitionError::SkipAfterStart { from: "Built" }
        );
    }

    #[test]
    fn test_failed_display_names_stage_and_reason() {
        let state = LifecycleState::Failed {
            stage: Stage::Build,
            reason: "exit 101".to_string(),
        };
        assert_eq!(state.to_string(), "Failed(stage=Build, reason=exit 101)");
    }
}
