//! aura-deploy Library
//!
//! Builds the AuraDB binaries, stages them into a platform-independent
//! install root, provisions a dedicated service principal, emits a native
//! package (deb, pkg, msi), and registers and verifies the service with the
//! native service manager (systemd, launchd, Windows SCM).

pub mod assembler;
pub mod builder;
pub mod cancel;
pub mod cli;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod emitter;
pub mod error;
pub mod fakes;
pub mod hooks;
pub mod lifecycle;
pub mod orchestrator;
pub mod platform;
pub mod process_guard;
pub mod provisioner;
pub mod registrar;
pub mod summary;

// Re-export main types for convenience
pub use assembler::{InstallEntry, InstallRoot};
pub use builder::BuildArtifact;
pub use cancel::{CancelToken, Clock, SystemClock};
pub use command::{CommandRunner, Invocation, SystemRunner, ToolArgs, ToolOutput};
pub use config::DeployConfig;
pub use descriptor::ServiceDescriptor;
pub use error::{DeployError, StageFailure};
pub use lifecycle::{LifecycleState, PipelineMode, Stage, TargetLifecycle};
pub use orchestrator::{DeployOptions, HostServices, Orchestrator, TargetSelection};
pub use platform::{PlatformTarget, Resolution};
pub use process_guard::ChildRegistry;
pub use provisioner::{ProvisionHost, SystemPrincipal};
pub use registrar::{PollPolicy, ServiceManager};
pub use summary::{RunSummary, TargetReport};
