//! Deployment orchestrator
//!
//! Runs the per-target pipeline
//!
//! ```text
//! build → assemble → provision → package → register → verify
//! ```
//!
//! for every resolved target and collects the outcomes in a [`RunSummary`].
//!
//! # Isolation
//!
//! A stage failure ends that target's pipeline only. It is recorded as
//! `Failed(stage, reason)` and the remaining targets carry on. The only
//! errors that abort a whole run are invocation errors (an unknown target
//! name) and lifecycle violations, which indicate a bug.
//!
//! # Parallelism
//!
//! Targets run one after another by default. With `parallel` set, each
//! target gets its own scoped thread and reports into the shared summary
//! under a mutex. Stages within one target always run in order.

use crate::assembler::{InstallRoot, assemble};
use crate::builder;
use crate::cancel::{CancelToken, Clock, SystemClock};
use crate::command::{CommandRunner, SystemRunner};
use crate::config::DeployConfig;
use crate::emitter;
use crate::error::{DeployError, Result, StageFailure};
use crate::lifecycle::{LifecycleState, PipelineMode, TargetLifecycle, TransitionError};
use crate::platform::{self, PlatformTarget, Resolution};
use crate::provisioner::{self, CommandHost, ProvisionHost};
use crate::registrar::{self, NativeServiceManager, PollPolicy, ServiceManager};
use crate::summary::{RunSummary, TargetReport};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Which targets a run covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelection {
    /// Every supported family (only the host's one actually runs)
    All,
    /// Explicitly named targets; `all` among them means [`TargetSelection::All`]
    Explicit(Vec<String>),
}

impl TargetSelection {
    /// Selection from an optional CLI argument. Empty or `all` selects all.
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg.map(str::trim) {
            None | Some("") => Self::All,
            Some(name) if name.eq_ignore_ascii_case("all") => Self::All,
            Some(names) => Self::Explicit(names.split(',').map(|n| n.trim().to_string()).collect()),
        }
    }
}

/// Run-wide options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOptions {
    pub mode: PipelineMode,
    pub parallel: bool,
    /// Filesystem root the payload is installed beneath before service
    /// registration (normally `/`)
    pub host_root: PathBuf,
    /// Where packages are written
    pub out_dir: PathBuf,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Full,
            parallel: false,
            host_root: PathBuf::from("/"),
            out_dir: PathBuf::from("target/deploy"),
        }
    }
}

/// Per-target access to the host's account database and service manager
pub trait HostServices: Send + Sync {
    fn provision_host(&self, target: PlatformTarget) -> Arc<dyn ProvisionHost>;
    fn service_manager(&self, target: PlatformTarget) -> Arc<dyn ServiceManager>;
}

/// The real host, driven through native tools
pub struct NativeHost {
    runner: Arc<dyn CommandRunner>,
    host_root: PathBuf,
    app: String,
}

impl NativeHost {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        host_root: impl Into<PathBuf>,
        app: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            host_root: host_root.into(),
            app: app.into(),
        }
    }
}

impl HostServices for NativeHost {
    fn provision_host(&self, target: PlatformTarget) -> Arc<dyn ProvisionHost> {
        Arc::new(CommandHost::new(target, self.runner.clone(), self.host_root.clone()))
    }

    fn service_manager(&self, target: PlatformTarget) -> Arc<dyn ServiceManager> {
        Arc::new(NativeServiceManager::new(
            target.dialect(),
            self.runner.clone(),
            self.host_root.clone(),
            target.layout(&self.app).descriptor_dir,
        ))
    }
}

/// Why a target's pipeline stopped early
enum Halt {
    Stage(StageFailure),
    Lifecycle(TransitionError),
}

impl From<StageFailure> for Halt {
    fn from(failure: StageFailure) -> Self {
        Self::Stage(failure)
    }
}

impl From<TransitionError> for Halt {
    fn from(err: TransitionError) -> Self {
        Self::Lifecycle(err)
    }
}

/// Sequences the deployment stages for one or more targets
pub struct Orchestrator {
    config: DeployConfig,
    options: DeployOptions,
    runner: Arc<dyn CommandRunner>,
    services: Option<Arc<dyn HostServices>>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
}

impl Orchestrator {
    /// Orchestrator against the real host
    pub fn new(config: DeployConfig, options: DeployOptions) -> Self {
        Self {
            config,
            options,
            runner: Arc::new(SystemRunner),
            services: None,
            clock: Arc::new(SystemClock),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_host_services(mut self, services: Arc<dyn HostServices>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    fn host_services(&self) -> Arc<dyn HostServices> {
        match &self.services {
            Some(services) => services.clone(),
            None => Arc::new(NativeHost::new(
                self.runner.clone(),
                self.options.host_root.clone(),
                self.config.app.clone(),
            )),
        }
    }

    /// Resolve `selection` against the host signal.
    ///
    /// # Errors
    ///
    /// `UnknownPlatform` if any explicit name matches no family.
    pub fn resolve(
        &self,
        selection: &TargetSelection,
        host_signal: &str,
    ) -> Result<Vec<Resolution>> {
        let names = match selection {
            TargetSelection::All => return Ok(platform::resolve_all(host_signal)),
            TargetSelection::Explicit(names) if names.is_empty() => {
                return Ok(platform::resolve_all(host_signal));
            }
            TargetSelection::Explicit(names) => names,
        };
        if names.iter().any(|name| name.eq_ignore_ascii_case("all")) {
            return Ok(platform::resolve_all(host_signal));
        }

        let targets = names
            .iter()
            .map(|name| platform::parse_target(name))
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(targets
            .into_iter()
            .map(|target| platform::resolve_target(target, host_signal))
            .collect())
    }

    /// Resolve and run.
    pub fn run(&self, selection: &TargetSelection, host_signal: &str) -> Result<RunSummary> {
        let plan = self.resolve(selection, host_signal)?;
        self.run_plan(plan)
    }

    /// Run an already-resolved plan
    pub fn run_plan(&self, plan: Vec<Resolution>) -> Result<RunSummary> {
        let mut summary = RunSummary::new(self.options.mode);
        let mut targets = Vec::new();
        for resolution in plan {
            match resolution {
                Resolution::Target(target) => targets.push(target),
                Resolution::Skip {
                    target: Some(target),
                    reason,
                } => {
                    info!("Skipping {}: {}", target, reason);
                    let mut lifecycle = TargetLifecycle::new(self.options.mode);
                    lifecycle.skip(reason)?;
                    summary.record(target, TargetReport::without_outputs(&lifecycle));
                }
                Resolution::Skip { target: None, reason } => {
                    info!("Nothing to deploy: {}", reason);
                    summary.note(reason);
                }
            }
        }

        if self.options.parallel && targets.len() > 1 {
            self.run_parallel(&targets, summary)
        } else {
            for target in targets {
                let report = self.run_target(target)?;
                summary.record(target, report);
            }
            Ok(summary)
        }
    }

    fn run_parallel(&self, targets: &[PlatformTarget], summary: RunSummary) -> Result<RunSummary> {
        let summary = Mutex::new(summary);
        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|&target| {
                    let summary = &summary;
                    scope.spawn(move || -> Result<()> {
                        let report = self.run_target(target)?;
                        summary
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .record(target, report);
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        });
        results.into_iter().collect::<Result<()>>()?;
        Ok(summary.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Run one target's pipeline to a terminal state
    fn run_target(&self, target: PlatformTarget) -> Result<TargetReport> {
        info!("=== {} ({}) ===", target, self.options.mode_label());
        let mut lifecycle = TargetLifecycle::new(self.options.mode);
        let mut report = TargetReport::without_outputs(&lifecycle);

        match self.pipeline(target, &mut lifecycle, &mut report) {
            Ok(()) => info!("{}: {}", target, lifecycle.current()),
            Err(Halt::Stage(failure)) => {
                error!("{}: {}", target, failure);
                lifecycle.fail(&failure)?;
            }
            Err(Halt::Lifecycle(err)) => return Err(DeployError::Transition(err)),
        }

        report.state = lifecycle.current().clone();
        Ok(report)
    }

    fn pipeline(
        &self,
        target: PlatformTarget,
        lifecycle: &mut TargetLifecycle,
        report: &mut TargetReport,
    ) -> std::result::Result<(), Halt> {
        let config = &self.config;
        let services = self.host_services();

        let artifacts = builder::build(&config.binaries, target, config, self.runner.as_ref())?;
        report.artifacts = artifacts.iter().map(|artifact| artifact.path.clone()).collect();
        lifecycle.transition_to(LifecycleState::Built)?;

        let root = assemble(&artifacts, target, config);
        lifecycle.transition_to(LifecycleState::Staged)?;

        if self.options.mode == PipelineMode::Full {
            let host = services.provision_host(target);
            let dirs = provisioner::service_directories(&root.layout, &root.principal);
            provisioner::provision(
                host.as_ref(),
                target.id_sensitive(),
                &root.principal,
                &root.layout.data_dir,
                &dirs,
            )?;
            lifecycle.transition_to(LifecycleState::Provisioned)?;
        }

        let package = emitter::emit(&root, config, &self.options.out_dir, self.runner.as_ref())?;
        report.package = Some(package);
        lifecycle.transition_to(LifecycleState::Packaged)?;

        if self.options.mode == PipelineMode::PackageOnly {
            return Ok(());
        }

        let manager = services.service_manager(target);
        self.install_payload(&root)?;
        for service in &root.services {
            registrar::register(service, manager.as_ref())?;
        }
        lifecycle.transition_to(LifecycleState::Registered)?;

        let policy = PollPolicy::from(&config.service);
        for service in &root.services {
            let clock = self.clock.as_ref();
            registrar::start_and_verify(service, manager.as_ref(), policy, clock, &self.cancel)?;
        }
        lifecycle.transition_to(LifecycleState::Verified)?;
        Ok(())
    }

    /// Put the payload in place on this host so the service manager can
    /// find the executables
    fn install_payload(&self, root: &InstallRoot) -> std::result::Result<(), StageFailure> {
        let host_root = &self.options.host_root;
        let written = root.materialize(host_root).map_err(|e| {
            let reason = format!("installing payload under {}: {}", host_root.display(), e);
            StageFailure::Registration(reason)
        })?;
        if root.services.is_empty() {
            warn!("{}: no service binaries configured, nothing to register", root.target);
        }
        info!("{}: installed {} files under {}", root.target, written.len(), host_root.display());
        Ok(())
    }
}

impl DeployOptions {
    fn mode_label(&self) -> &'static str {
        match self.mode {
            PipelineMode::Full => "full deploy",
            PipelineMode::PackageOnly => "package only",
        }
    }
}
