use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Filesystem root used when `--host-root` is not given
pub const DEFAULT_HOST_ROOT: &str = "/";

/// aura-deploy - Build, package, provision and register AuraDB services
#[derive(Parser, Debug)]
#[command(name = "aura-deploy")]
#[command(
    about = "Build, package and install AuraDB as a native service on Linux, macOS and Windows"
)]
#[command(version)]
pub struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Arguments for the default `deploy` command
    #[command(flatten)]
    pub deploy: DeployArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build, package, provision and register (the default)
    Deploy(DeployArgs),
    /// Print the install root, hooks and descriptors for a target without
    /// touching anything
    Render {
        /// Target platform (linux, windows, macos)
        target: String,
        /// Deploy configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate a deploy configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct DeployArgs {
    /// linux, windows or macos (aliases accepted), a comma-separated list,
    /// or all. Empty means all.
    pub target: Option<String>,

    /// Deploy configuration file (default: ./aura-deploy.json if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host platform signal (overrides AURA_DEPLOY_HOST and the compiled OS)
    #[arg(long, value_name = "SIGNAL")]
    pub host: Option<String>,

    /// Run targets concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Stop after packaging; skip provisioning and service registration
    #[arg(long)]
    pub package_only: bool,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub run_timeout: Option<u64>,

    /// Where packages are written (default: the config's out_dir)
    #[arg(long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Filesystem root the payload is installed beneath before registration
    #[arg(long, value_name = "DIR", default_value = DEFAULT_HOST_ROOT)]
    pub host_root: PathBuf,
}

impl Default for DeployArgs {
    fn default() -> Self {
        Self {
            target: None,
            config: None,
            host: None,
            parallel: false,
            package_only: false,
            run_timeout: None,
            out_dir: None,
            host_root: PathBuf::from(DEFAULT_HOST_ROOT),
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Deploy arguments, whether given to `deploy` or at top level.
    ///
    /// `Ok(None)` means another subcommand was chosen. Deploy flags placed in
    /// front of a subcommand are rejected rather than silently dropped.
    pub fn deploy_args(&self) -> Result<Option<&DeployArgs>> {
        let top_level_used = self.deploy != DeployArgs::default();
        match &self.command {
            None => Ok(Some(&self.deploy)),
            Some(command) if top_level_used => {
                bail!(
                    "deploy arguments must follow the subcommand, not precede `{}`",
                    command.name()
                )
            }
            Some(Commands::Deploy(args)) => Ok(Some(args)),
            Some(_) => Ok(None),
        }
    }
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Deploy(_) => "deploy",
            Commands::Render { .. } => "render",
            Commands::Validate { .. } => "validate",
        }
    }
}
