//! Artifact builder
//!
//! Pure pass-through to `cargo build`. Produced files are recorded where
//! cargo leaves them and never moved.

use crate::command::{CommandRunner, ToolArgs};
use crate::config::{BinarySpec, DeployConfig};
use crate::error::StageFailure;
use crate::platform::PlatformTarget;
use std::path::{Path, PathBuf};
use tracing::info;

/// Permission mode of installed executables
pub const EXECUTABLE_MODE: u32 = 0o755;

/// One executable produced by the build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    /// Logical (cargo bin) name
    pub name: String,
    /// Where cargo wrote the file
    pub path: PathBuf,
    /// Mode the file gets when installed
    pub mode: u32,
    /// Whether the binary runs as a service
    pub service: bool,
    /// Service arguments from the binary's config entry
    pub args: Vec<String>,
}

impl BuildArtifact {
    /// File name on disk, including any platform suffix
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Type-safe arguments for `cargo build --release`
#[derive(Debug, Clone)]
pub struct CargoBuildArgs {
    pub bin: String,
    /// Cross-compilation triple, if any
    pub target_triple: Option<String>,
}

impl ToolArgs for CargoBuildArgs {
    fn program(&self) -> &'static str {
        "cargo"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--release".to_string(),
            "--bin".to_string(),
            self.bin.clone(),
        ];
        if let Some(triple) = &self.target_triple {
            args.push("--target".to_string());
            args.push(triple.clone());
        }
        args
    }
}

/// `target/[<triple>/]release/<name>[.exe]` beneath `workspace`
pub fn output_path(
    workspace: &Path,
    binary: &str,
    target: PlatformTarget,
    triple: Option<&str>,
) -> PathBuf {
    let mut path = workspace.join("target");
    if let Some(triple) = triple {
        path.push(triple);
    }
    path.push("release");
    path.push(format!("{}{}", binary, target.exe_suffix()));
    path
}

/// Build every configured binary for `target`. Stops at the first failure.
pub fn build(
    binaries: &[BinarySpec],
    target: PlatformTarget,
    config: &DeployConfig,
    runner: &dyn CommandRunner,
) -> Result<Vec<BuildArtifact>, StageFailure> {
    let triple = config.cargo_targets.get(&target).map(String::as_str);
    let mut artifacts = Vec::with_capacity(binaries.len());

    for binary in binaries {
        let args = CargoBuildArgs {
            bin: binary.name.clone(),
            target_triple: triple.map(str::to_string),
        };
        let invocation = args.invocation().current_dir(&config.workspace_dir);

        let output = runner
            .run(&invocation)
            .map_err(|e| StageFailure::Build(format!("{}: {:#}", binary.name, e)))?;
        if !output.success {
            return Err(StageFailure::Build(format!(
                "{}: {}",
                binary.name,
                output.diagnostic()
            )));
        }

        let path = output_path(&config.workspace_dir, &binary.name, target, triple);
        if !path.is_file() {
            return Err(StageFailure::Build(format!(
                "{}: build succeeded but {} does not exist",
                binary.name,
                path.display()
            )));
        }

        info!("Built {} -> {}", binary.name, path.display());
        artifacts.push(BuildArtifact {
            name: binary.name.clone(),
            path,
            mode: EXECUTABLE_MODE,
            service: binary.service,
            args: binary.args.clone(),
        });
    }

    Ok(artifacts)
}
