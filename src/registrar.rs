//! Service registration and start verification (post-install step)
//!
//! Installs a [`ServiceDescriptor`] with the native service manager, starts
//! it, and polls for a running signal.
//!
//! # Start Verification
//!
//! - Running before the deadline: verified as soon as it is observed.
//! - Deadline elapsed: [`StageFailure::Start`] at the timeout boundary,
//!   never before it.
//! - Cancellation during the wait: [`StageFailure::Start`] immediately.
//! - A failing status query counts as "not running yet".

use crate::cancel::{CancelToken, Clock, sleep_cancellable};
use crate::command::{CommandRunner, Invocation};
use crate::config::ServiceTiming;
use crate::descriptor::ServiceDescriptor;
use crate::error::StageFailure;
use crate::platform::{ServiceDialect, TargetPath};
use anyhow::{Context, anyhow};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Native service manager operations
pub trait ServiceManager: Send + Sync {
    /// Install (or update) and enable the descriptor
    fn install(&self, descriptor: &ServiceDescriptor) -> anyhow::Result<()>;

    /// Start (or restart) the service
    fn start(&self, id: &str) -> anyhow::Result<()>;

    /// Whether the service currently reports running
    fn is_running(&self, id: &str) -> anyhow::Result<bool>;
}

/// How long and how often to poll for a running service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&ServiceTiming> for PollPolicy {
    fn from(timing: &ServiceTiming) -> Self {
        Self {
            interval: timing.poll_interval(),
            timeout: timing.start_timeout(),
        }
    }
}

/// Proof that a service was observed running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub id: String,
    /// Time from the start request until running was observed
    pub after: Duration,
}

/// Install, start and verify one service.
pub fn register_and_start(
    descriptor: &ServiceDescriptor,
    manager: &dyn ServiceManager,
    policy: PollPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<Verified, StageFailure> {
    register(descriptor, manager)?;
    start_and_verify(descriptor, manager, policy, clock, cancel)
}

/// Install and enable the descriptor with the service manager
pub fn register(
    descriptor: &ServiceDescriptor,
    manager: &dyn ServiceManager,
) -> Result<(), StageFailure> {
    manager
        .install(descriptor)
        .map_err(|e| StageFailure::Registration(format!("{}: {:#}", descriptor.id, e)))?;
    info!("Registered service {}", descriptor.id);
    Ok(())
}

/// Start a registered service and poll until it reports running
pub fn start_and_verify(
    descriptor: &ServiceDescriptor,
    manager: &dyn ServiceManager,
    policy: PollPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<Verified, StageFailure> {
    let id = descriptor.id.as_str();
    manager
        .start(id)
        .map_err(|e| StageFailure::Start(format!("{}: start rejected: {:#}", id, e)))?;

    let started = clock.now();
    let deadline = started.checked_add(policy.timeout).ok_or_else(|| {
        StageFailure::Start(format!("{}: start timeout {:?} out of range", id, policy.timeout))
    })?;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled(id));
        }

        match manager.is_running(id) {
            Ok(true) => {
                let after = clock.now() - started;
                info!("Service {} running after {:?}", id, after);
                return Ok(Verified {
                    id: id.to_string(),
                    after,
                });
            }
            Ok(false) => debug!("Service {} not running yet", id),
            Err(e) => warn!("Status query for {} failed: {:#}", id, e),
        }

        let now = clock.now();
        if now >= deadline {
            return Err(StageFailure::Start(format!(
                "{}: not running after {:?}",
                id, policy.timeout
            )));
        }
        if !sleep_cancellable(clock, cancel, policy.interval.min(deadline - now)) {
            return Err(cancelled(id));
        }
    }
}

fn cancelled(id: &str) -> StageFailure {
    StageFailure::Start(format!("{}: cancelled while waiting for running state", id))
}

/// `sc.exe` exit code for "An instance of the service is already running"
const SCM_ALREADY_RUNNING: i32 = 1056;

/// Service manager backed by `systemctl`, `launchctl` or `sc.exe`.
///
/// `install` writes the rendered descriptor beneath `host_root` first, so
/// the manager finds it where the package would have put it.
pub struct NativeServiceManager {
    dialect: ServiceDialect,
    runner: Arc<dyn CommandRunner>,
    host_root: PathBuf,
    descriptor_dir: TargetPath,
}

impl NativeServiceManager {
    pub fn new(
        dialect: ServiceDialect,
        runner: Arc<dyn CommandRunner>,
        host_root: impl Into<PathBuf>,
        descriptor_dir: TargetPath,
    ) -> Self {
        Self {
            dialect,
            runner,
            host_root: host_root.into(),
            descriptor_dir,
        }
    }

    fn write_descriptor(&self, descriptor: &ServiceDescriptor) -> anyhow::Result<TargetPath> {
        let target_path = self.descriptor_dir.join(&descriptor.file_name(self.dialect));
        let host_path = self.host_root.join(target_path.staging_relative());
        if let Some(parent) = host_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&host_path, descriptor.render(self.dialect))
            .with_context(|| format!("writing {}", host_path.display()))?;
        debug!("Wrote descriptor {}", host_path.display());
        Ok(target_path)
    }

    fn sc(args: &[&str]) -> Invocation {
        Invocation::new("sc.exe").args(args.iter().copied())
    }
}

impl ServiceManager for NativeServiceManager {
    fn install(&self, descriptor: &ServiceDescriptor) -> anyhow::Result<()> {
        let path = self.write_descriptor(descriptor)?;
        let id = descriptor.id.as_str();
        match self.dialect {
            ServiceDialect::Systemd => {
                self.runner.run_checked(&Invocation::new("systemctl").arg("daemon-reload"))?;
                self.runner
                    .run_checked(&Invocation::new("systemctl").args(["enable", id]))?;
            }
            ServiceDialect::Launchd => {
                // Not loaded yet is fine
                let label = format!("system/{}", id);
                let _ = self
                    .runner
                    .run(&Invocation::new("launchctl").args(["bootout", &label]))?;
                self.runner.run_checked(
                    &Invocation::new("launchctl").args(["bootstrap", "system", path.as_str()]),
                )?;
            }
            ServiceDialect::Scm => {
                let bin_path = descriptor.scm_bin_path();
                let account = format!(".\\{}", descriptor.run_as);
                let verb = if self.runner.run(&Self::sc(&["query", id]))?.success {
                    "config"
                } else {
                    "create"
                };
                self.runner.run_checked(&Self::sc(&[
                    verb,
                    id,
                    "binPath=",
                    bin_path.as_str(),
                    "start=",
                    "auto",
                    "obj=",
                    account.as_str(),
                    "password=",
                    "",
                ]))?;
                self.runner.run_checked(&Self::sc(&[
                    "failure", id, "reset=", "86400", "actions=", "restart/5000",
                ]))?;
            }
        }
        Ok(())
    }

    fn start(&self, id: &str) -> anyhow::Result<()> {
        match self.dialect {
            ServiceDialect::Systemd => {
                self.runner.run_checked(&Invocation::new("systemctl").args(["restart", id]))?;
            }
            ServiceDialect::Launchd => {
                let label = format!("system/{}", id);
                self.runner
                    .run_checked(&Invocation::new("launchctl").args(["kickstart", "-k", &label]))?;
            }
            ServiceDialect::Scm => {
                let output = self.runner.run(&Self::sc(&["start", id]))?;
                if !output.success && output.exit_code != Some(SCM_ALREADY_RUNNING) {
                    return Err(anyhow!("sc.exe start {}: {}", id, output.diagnostic()));
                }
            }
        }
        Ok(())
    }

    fn is_running(&self, id: &str) -> anyhow::Result<bool> {
        match self.dialect {
            ServiceDialect::Systemd => Ok(self
                .runner
                .run(&Invocation::new("systemctl").args(["is-active", "--quiet", id]))?
                .success),
            ServiceDialect::Launchd => {
                let output = self
                    .runner
                    .run(&Invocation::new("launchctl").args(["print", &format!("system/{}", id)]))?;
                Ok(output.success && output.stdout.contains("state = running"))
            }
            ServiceDialect::Scm => {
                let output = self.runner.run(&Self::sc(&["query", id]))?;
                Ok(output.success && output.stdout.contains("RUNNING"))
            }
        }
    }
}
