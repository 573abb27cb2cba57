//! Error handling module for aura-deploy
//!
//! Two layers of errors, both built on thiserror:
//!
//! - [`DeployError`] covers malformed invocations (bad target name, broken
//!   config file). These abort the run before any pipeline starts.
//! - [`StageFailure`] covers everything that can go wrong inside one target's
//!   pipeline. These are caught at the pipeline boundary and recorded in the
//!   run summary; they never abort sibling targets.

use crate::lifecycle::{Stage, TransitionError};
use thiserror::Error;

/// Invocation-level error type
#[derive(Error, Debug)]
pub enum DeployError {
    /// An explicitly requested platform name matches no supported family
    #[error("Unknown platform '{0}' (expected linux, windows, macos or all)")]
    UnknownPlatform(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors (config file, staging tree)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Lifecycle state machine transition errors
    #[error("Lifecycle transition error: {0}")]
    Transition(#[from] TransitionError),
}

/// Result type alias for invocation-level operations
pub type Result<T> = std::result::Result<T, DeployError>;

impl DeployError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Which part of provisioning failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionFailureKind {
    /// The principal could not be queried or created
    PrincipalCreation,
    /// A data/log directory could not be created or its owner/mode applied
    DirectoryPermission,
}

impl std::fmt::Display for ProvisionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrincipalCreation => write!(f, "principal creation"),
            Self::DirectoryPermission => write!(f, "directory permission"),
        }
    }
}

/// A fatal failure inside one target's pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageFailure {
    /// The build toolchain returned nonzero or produced no output
    #[error("build failed: {0}")]
    Build(String),

    /// The principal or its directories could not be provisioned
    #[error("provisioning failed ({kind}): {reason}")]
    Provision {
        kind: ProvisionFailureKind,
        reason: String,
    },

    /// The native packaging tool failed; carries its diagnostic verbatim
    #[error("packaging failed: {0}")]
    Packaging(String),

    /// The service manager rejected the descriptor
    #[error("service registration failed: {0}")]
    Registration(String),

    /// The service installed but did not reach a running state
    #[error("service installed but would not start: {0}")]
    Start(String),
}

impl StageFailure {
    /// Create a principal-creation failure
    pub fn principal(reason: impl Into<String>) -> Self {
        Self::Provision {
            kind: ProvisionFailureKind::PrincipalCreation,
            reason: reason.into(),
        }
    }

    /// Create a directory-permission failure
    pub fn directory(reason: impl Into<String>) -> Self {
        Self::Provision {
            kind: ProvisionFailureKind::DirectoryPermission,
            reason: reason.into(),
        }
    }

    /// The lifecycle stage this failure is recorded against
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Build(_) => Stage::Build,
            Self::Provision { .. } => Stage::Provision,
            Self::Packaging(_) => Stage::Package,
            Self::Registration(_) => Stage::Register,
            Self::Start(_) => Stage::Start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeployError::UnknownPlatform("solaris".to_string());
        assert_eq!(
            err.to_string(),
            "Unknown platform 'solaris' (expected linux, windows, macos or all)"
        );

        let err = DeployError::config("app name is empty");
        assert_eq!(err.to_string(), "Configuration error: app name is empty");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DeployError = io_err.into();
        assert!(matches!(err, DeployError::Io(_)));
    }

    #[test]
    fn test_stage_failure_maps_to_stage() {
        assert_eq!(StageFailure::Build("x".into()).stage(), Stage::Build);
        assert_eq!(StageFailure::principal("x").stage(), Stage::Provision);
        assert_eq!(StageFailure::directory("x").stage(), Stage::Provision);
        assert_eq!(StageFailure::Packaging("x".into()).stage(), Stage::Package);
        assert_eq!(StageFailure::Registration("x".into()).stage(), Stage::Register);
        assert_eq!(StageFailure::Start("x".into()).stage(), Stage::Start);
    }

    #[test]
    fn test_start_failure_is_distinct_from_registration() {
        let start = StageFailure::Start("timed out after 30s".into());
        let reg = StageFailure::Registration("unit rejected".into());
        assert_ne!(start.stage(), reg.stage());
        assert!(start.to_string().contains("would not start"));
    }

    #[test]
    fn test_provision_failure_display() {
        let err = StageFailure::directory("chmod: Operation not permitted");
        assert_eq!(
            err.to_string(),
            "provisioning failed (directory permission): chmod: Operation not permitted"
        );
    }
}
