//! Tests for Deployment Orchestration
//!
//! These tests drive whole pipelines against in-memory fakes:
//! - Host resolution (run, skip, unknown names)
//! - Stage ordering and terminal states
//! - Per-target failure isolation, sequential and parallel
//! - Service start verification timeout and cancellation
//! - Package-only runs

use aura_deploy::builder::output_path;
use aura_deploy::cancel::{CancelToken, Clock};
use aura_deploy::command::ToolOutput;
use aura_deploy::config::DeployConfig;
use aura_deploy::error::DeployError;
use aura_deploy::fakes::{
    FakeClock, FakeHostServices, FakeServiceManager, MemoryHost, ScriptedRunner,
};
use aura_deploy::lifecycle::{LifecycleState, PipelineMode, Stage};
use aura_deploy::orchestrator::{DeployOptions, Orchestrator, TargetSelection};
use aura_deploy::platform::{PlatformTarget, Resolution};
use aura_deploy::provisioner::{DATA_DIR_MODE, LOG_DIR_MODE, RESERVED_ID_FLOOR};
use aura_deploy::summary::RunSummary;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WINDOWS_TRIPLE: &str = "x86_64-pc-windows-gnu";

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    workspace: TempDir,
    host_root: TempDir,
    out_dir: TempDir,
    config: DeployConfig,
    runner: Arc<ScriptedRunner>,
    services: FakeHostServices,
    clock: Arc<FakeClock>,
    cancel: CancelToken,
}

impl Fixture {
    fn new(manager: FakeServiceManager) -> Self {
        let workspace = TempDir::new().unwrap();
        let mut config = DeployConfig {
            workspace_dir: workspace.path().to_path_buf(),
            ..DeployConfig::default()
        };
        config
            .cargo_targets
            .insert(PlatformTarget::Windows, WINDOWS_TRIPLE.to_string());

        Self {
            workspace,
            host_root: TempDir::new().unwrap(),
            out_dir: TempDir::new().unwrap(),
            config,
            runner: Arc::new(ScriptedRunner::new()),
            services: FakeHostServices::new(MemoryHost::new(), manager),
            clock: Arc::new(FakeClock::new()),
            cancel: CancelToken::new(),
        }
    }

    /// Pretend cargo already produced every binary for `target`
    fn with_outputs(self, target: PlatformTarget) -> Self {
        let triple = self.config.cargo_targets.get(&target).cloned();
        for binary in &self.config.binaries {
            let path = output_path(self.workspace.path(), &binary.name, target, triple.as_deref());
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, format!("#!/bin/sh\n# {}\n", binary.name)).unwrap();
        }
        self
    }

    fn fail_windows_build(self) -> Self {
        self.runner.respond(
            &format!("cargo build --release --bin aura-server --target {}", WINDOWS_TRIPLE),
            ToolOutput::failed(101, "error: linker `x86_64-w64-mingw32-gcc` not found"),
        );
        self
    }

    fn orchestrator(&self, mode: PipelineMode, parallel: bool) -> Orchestrator {
        let options = DeployOptions {
            mode,
            parallel,
            host_root: self.host_root.path().to_path_buf(),
            out_dir: self.out_dir.path().to_path_buf(),
        };
        Orchestrator::new(self.config.clone(), options)
            .with_runner(self.runner.clone())
            .with_host_services(Arc::new(self.services.clone()))
            .with_clock(self.clock.clone())
            .with_cancel(self.cancel.clone())
    }

    fn deploy(&self, targets: &str, host: &str) -> RunSummary {
        self.orchestrator(PipelineMode::Full, false)
            .run(&TargetSelection::from_arg(Some(targets)), host)
            .unwrap()
    }
}

fn failed_stage(summary: &RunSummary, target: PlatformTarget) -> (Stage, String) {
    match summary.state(target) {
        Some(LifecycleState::Failed { stage, reason }) => (*stage, reason.clone()),
        other => panic!("{} should have failed, got {:?}", target, other),
    }
}

// =============================================================================
// Resolution
// =============================================================================

#[test]
fn test_linux_target_on_linux_host_is_verified() {
    let fixture =
        Fixture::new(FakeServiceManager::running_after(1)).with_outputs(PlatformTarget::Linux);
    let summary = fixture.deploy("linux", "linux-gnu");

    assert_eq!(summary.state(PlatformTarget::Linux), Some(&LifecycleState::Verified));
    assert_eq!(summary.exit_code(), 0);

    let report = summary.get(PlatformTarget::Linux).unwrap();
    assert_eq!(report.artifacts.len(), 2);
    assert_eq!(
        report.package.as_deref(),
        Some(fixture.out_dir.path().join("aura-0.1.0.deb").as_path())
    );
    assert_eq!(fixture.runner.calls_matching("cargo build --release --bin"), 2);
    assert_eq!(fixture.runner.calls_matching("dpkg-deb --root-owner-group --build"), 1);
    assert_eq!(fixture.services.manager.installed(), vec!["aura-server".to_string()]);
    assert_eq!(fixture.services.manager.started(), vec!["aura-server".to_string()]);
}

#[test]
fn test_macos_target_on_linux_host_is_skipped() {
    let fixture = Fixture::new(FakeServiceManager::new());
    let summary = fixture.deploy("macos", "linux-gnu");

    assert_eq!(
        summary.state(PlatformTarget::MacOs),
        Some(&LifecycleState::Skipped {
            reason: "host is linux".to_string()
        })
    );
    assert_eq!(summary.exit_code(), 0);
    assert!(fixture.runner.command_lines().is_empty(), "a skipped target runs nothing");
    assert_eq!(fixture.services.host.principal_count(), 0);
}

#[test]
fn test_windows_build_failure_is_recorded() {
    let fixture = Fixture::new(FakeServiceManager::new()).fail_windows_build();
    let summary = fixture.deploy("windows", "windows");

    let (stage, reason) = failed_stage(&summary, PlatformTarget::Windows);
    assert_eq!(stage, Stage::Build);
    assert!(reason.contains("linker"), "diagnostic should be carried: {}", reason);
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.get(PlatformTarget::Windows).unwrap().package.is_none());
    assert!(fixture.services.manager.installed().is_empty());
}

#[test]
fn test_all_on_linux_host_runs_only_linux() {
    let fixture =
        Fixture::new(FakeServiceManager::new()).with_outputs(PlatformTarget::Linux);
    let summary = fixture.deploy("all", "linux");

    assert_eq!(summary.len(), 3);
    assert_eq!(summary.state(PlatformTarget::Linux), Some(&LifecycleState::Verified));
    assert!(summary.get(PlatformTarget::Windows).unwrap().is_skipped());
    assert!(summary.get(PlatformTarget::MacOs).unwrap().is_skipped());
    assert!(summary.is_success());
}

#[test]
fn test_unknown_target_aborts_before_any_work() {
    let fixture = Fixture::new(FakeServiceManager::new());
    let err = fixture
        .orchestrator(PipelineMode::Full, false)
        .run(&TargetSelection::from_arg(Some("linux,beos")), "linux")
        .unwrap_err();

    assert!(matches!(err, DeployError::UnknownPlatform(ref name) if name == "beos"));
    assert!(fixture.runner.command_lines().is_empty());
}

// =============================================================================
// Pipeline effects
// =============================================================================

#[test]
fn test_full_run_provisions_principal_and_directories() {
    let fixture =
        Fixture::new(FakeServiceManager::new()).with_outputs(PlatformTarget::Linux);
    fixture.deploy("linux", "linux");

    let host = &fixture.services.host;
    let principal = host.principal("aura").expect("principal created");
    assert_eq!(principal.id, Some(RESERVED_ID_FLOOR));
    assert!(principal.shell_disabled());

    let layout = PlatformTarget::Linux.layout("aura");
    let data = host.directory(&layout.data_dir).unwrap();
    assert_eq!(data.owner.as_deref(), Some("aura"));
    assert_eq!(data.mode, DATA_DIR_MODE);
    let log = host.directory(&layout.log_dir).unwrap();
    assert_eq!(log.owner.as_deref(), Some("aura"));
    assert_eq!(log.mode, LOG_DIR_MODE);
}

#[test]
fn test_full_run_installs_payload_under_host_root() {
    let fixture =
        Fixture::new(FakeServiceManager::new()).with_outputs(PlatformTarget::Linux);
    fixture.deploy("linux", "linux");

    let root = fixture.host_root.path();
    assert!(root.join("usr/bin/aura-server").is_file());
    assert!(root.join("usr/bin/aura").is_file());
    let unit = fs::read_to_string(root.join("lib/systemd/system/aura-server.service")).unwrap();
    assert!(unit.contains("User=aura"));
    assert!(unit.contains("ExecStart=/usr/bin/aura-server"));
}

#[test]
fn test_second_run_reuses_existing_principal() {
    let fixture =
        Fixture::new(FakeServiceManager::new()).with_outputs(PlatformTarget::Linux);
    fixture.deploy("linux", "linux");
    let summary = fixture.deploy("linux", "linux");

    assert_eq!(summary.state(PlatformTarget::Linux), Some(&LifecycleState::Verified));
    assert_eq!(fixture.services.host.principal_count(), 1);
    assert_eq!(fixture.services.host.create_calls(), 1);
}

#[test]
fn test_provisioning_failure_stops_before_packaging() {
    let fixture =
        Fixture::new(FakeServiceManager::new()).with_outputs(PlatformTarget::Linux);
    fixture.services.host.fail_creation("useradd: cannot lock /etc/passwd");
    let summary = fixture.deploy("linux", "linux");

    let (stage, reason) = failed_stage(&summary, PlatformTarget::Linux);
    assert_eq!(stage, Stage::Provision);
    assert!(reason.contains("cannot lock"));
    assert!(summary.get(PlatformTarget::Linux).unwrap().package.is_none());
    assert_eq!(fixture.runner.calls_matching("dpkg-deb"), 0);
}

#[test]
fn test_packaging_failure_carries_tool_diagnostic() {
    let fixture =
        Fixture::new(FakeServiceManager::new()).with_outputs(PlatformTarget::Linux);
    fixture.runner.respond(
        "dpkg-deb",
        ToolOutput::failed(2, "dpkg-deb: error: control directory has bad permissions"),
    );
    let summary = fixture.deploy("linux", "linux");

    let (stage, reason) = failed_stage(&summary, PlatformTarget::Linux);
    assert_eq!(stage, Stage::Package);
    assert!(reason.contains("control directory has bad permissions"));
    assert!(fixture.services.manager.installed().is_empty());
}

#[test]
fn test_registration_rejection_is_register_failure() {
    let fixture =
        Fixture::new(FakeServiceManager::new()).with_outputs(PlatformTarget::Linux);
    fixture.services.manager.reject_install("Unit file is masked");
    let summary = fixture.deploy("linux", "linux");

    let (stage, reason) = failed_stage(&summary, PlatformTarget::Linux);
    assert_eq!(stage, Stage::Register);
    assert!(reason.contains("masked"));
    assert!(fixture.services.manager.started().is_empty());
}

// =============================================================================
// Start verification
// =============================================================================

#[test]
fn test_never_running_service_fails_at_timeout() {
    let fixture =
        Fixture::new(FakeServiceManager::never_running()).with_outputs(PlatformTarget::Linux);
    let started = fixture.clock.now();
    let summary = fixture.deploy("linux", "linux");

    let (stage, reason) = failed_stage(&summary, PlatformTarget::Linux);
    assert_eq!(stage, Stage::Start);
    assert!(reason.contains("not running after 30s"), "{}", reason);
    assert_ne!(summary.exit_code(), 0);

    // One query per second from t=0 through t=30, never past the deadline
    assert_eq!(fixture.services.manager.status_queries(), 31);
    assert_eq!(fixture.clock.now() - started, Duration::from_secs(30));
}

#[test]
fn test_slow_service_verified_within_timeout() {
    let fixture =
        Fixture::new(FakeServiceManager::running_after(5)).with_outputs(PlatformTarget::Linux);
    let started = fixture.clock.now();
    let summary = fixture.deploy("linux", "linux");

    assert_eq!(summary.state(PlatformTarget::Linux), Some(&LifecycleState::Verified));
    assert_eq!(fixture.services.manager.status_queries(), 5);
    assert_eq!(fixture.clock.now() - started, Duration::from_secs(4));
}

#[test]
fn test_cancelled_run_fails_start_immediately() {
    let fixture =
        Fixture::new(FakeServiceManager::never_running()).with_outputs(PlatformTarget::Linux);
    fixture.cancel.cancel();
    let summary = fixture.deploy("linux", "linux");

    let (stage, reason) = failed_stage(&summary, PlatformTarget::Linux);
    assert_eq!(stage, Stage::Start);
    assert!(reason.contains("cancelled"));
    assert_eq!(fixture.services.manager.status_queries(), 0);
    assert_eq!(fixture.clock.sleeps(), 0);
    // Earlier stages still completed
    assert!(summary.get(PlatformTarget::Linux).unwrap().package.is_some());
}

// =============================================================================
// Package-only mode
// =============================================================================

#[test]
fn test_package_only_stops_at_packaged() {
    let fixture = Fixture::new(FakeServiceManager::new()).with_outputs(PlatformTarget::MacOs);
    let summary = fixture
        .orchestrator(PipelineMode::PackageOnly, false)
        .run(&TargetSelection::from_arg(Some("mac")), "darwin23.1")
        .unwrap();

    assert_eq!(summary.state(PlatformTarget::MacOs), Some(&LifecycleState::Packaged));
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(fixture.runner.calls_matching("pkgbuild --root"), 1);
    assert_eq!(fixture.services.host.principal_count(), 0, "package-only never provisions");
    assert!(fixture.services.manager.installed().is_empty());
    assert_eq!(fs::read_dir(fixture.host_root.path()).unwrap().count(), 0);
}

// =============================================================================
// Isolation
// =============================================================================

fn all_targets() -> Vec<Resolution> {
    vec![
        Resolution::Target(PlatformTarget::Linux),
        Resolution::Target(PlatformTarget::Windows),
        Resolution::Target(PlatformTarget::MacOs),
    ]
}

fn assert_isolated(summary: &RunSummary) {
    assert_eq!(summary.state(PlatformTarget::Linux), Some(&LifecycleState::Verified));
    assert_eq!(summary.state(PlatformTarget::MacOs), Some(&LifecycleState::Verified));
    let (stage, _) = failed_stage(summary, PlatformTarget::Windows);
    assert_eq!(stage, Stage::Build);
    assert_eq!(summary.exit_code(), 1);
}

#[test]
fn test_failure_in_one_target_does_not_affect_others() {
    let fixture = Fixture::new(FakeServiceManager::new())
        .with_outputs(PlatformTarget::Linux)
        .with_outputs(PlatformTarget::MacOs)
        .fail_windows_build();
    let summary = fixture
        .orchestrator(PipelineMode::Full, false)
        .run_plan(all_targets())
        .unwrap();

    assert_isolated(&summary);
    assert!(fixture.services.host.principal("aura").is_some());
    assert!(fixture.services.host.principal("_aura").is_some());
}

#[test]
fn test_parallel_failure_in_one_target_does_not_affect_others() {
    let fixture = Fixture::new(FakeServiceManager::new())
        .with_outputs(PlatformTarget::Linux)
        .with_outputs(PlatformTarget::MacOs)
        .fail_windows_build();
    let summary = fixture
        .orchestrator(PipelineMode::Full, true)
        .run_plan(all_targets())
        .unwrap();

    assert_isolated(&summary);

    // Concurrent creations never share an id
    let linux = fixture.services.host.principal("aura").unwrap().id;
    let macos = fixture.services.host.principal("_aura").unwrap().id;
    assert_ne!(linux, macos);
    assert!(linux.unwrap() >= RESERVED_ID_FLOOR);
    assert!(macos.unwrap() >= RESERVED_ID_FLOOR);
}

#[test]
fn test_summary_digest_lists_every_target() {
    let fixture = Fixture::new(FakeServiceManager::new())
        .with_outputs(PlatformTarget::Linux)
        .fail_windows_build();
    let summary = fixture
        .orchestrator(PipelineMode::Full, false)
        .run_plan(vec![
            Resolution::Target(PlatformTarget::Linux),
            Resolution::Target(PlatformTarget::Windows),
            Resolution::Skip {
                target: Some(PlatformTarget::MacOs),
                reason: "host is linux".to_string(),
            },
        ])
        .unwrap();

    let digest = summary.to_string();
    assert!(digest.contains("linux"));
    assert!(digest.contains("FAILED at Build"));
    assert!(digest.contains("skipped (host is linux)"));
    assert!(digest.contains("Result: FAILED"));
}
