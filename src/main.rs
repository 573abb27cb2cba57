//! aura-deploy - Main entry point
//!
//! Parses the command line, initializes logging and interrupt handling, and
//! hands off to the orchestrator. Exit codes: 0 success, 1 a target failed,
//! 2 malformed invocation.

use anyhow::{Context, Result};
use aura_deploy::assembler::assemble;
use aura_deploy::builder::{BuildArtifact, EXECUTABLE_MODE, output_path};
use aura_deploy::cancel::CancelToken;
use aura_deploy::cli::{Cli, Commands, DeployArgs};
use aura_deploy::config::DeployConfig;
use aura_deploy::error::DeployError;
use aura_deploy::lifecycle::PipelineMode;
use aura_deploy::orchestrator::{DeployOptions, Orchestrator, TargetSelection};
use aura_deploy::platform::{host_signal_from_env, parse_target};
use aura_deploy::process_guard::{install_interrupt_handler, spawn_run_watchdog};
use aura_deploy::summary::{EXIT_FAILURE, EXIT_SUCCESS, EXIT_USAGE};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber. `RUST_LOG` overrides the level.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);
    debug!("CLI arguments parsed: {:?}", cli);

    let code = match cli.deploy_args() {
        Err(e) => {
            eprintln!("✗ {:#}", e);
            EXIT_USAGE
        }
        Ok(Some(args)) => deploy(args),
        Ok(None) => match &cli.command {
            Some(Commands::Render { target, config }) => render(target, config.as_deref()),
            Some(Commands::Validate { config }) => validate(config),
            Some(Commands::Deploy(_)) | None => EXIT_USAGE,
        },
    };
    std::process::exit(code);
}

/// Load (or default) and validate the deploy configuration
fn load_config(path: Option<&Path>) -> Result<DeployConfig> {
    let config = DeployConfig::load_or_default(path).with_context(|| {
        format!("loading deploy configuration {:?}", path.unwrap_or(Path::new("<default>")))
    })?;
    config.validate().context("invalid deploy configuration")?;
    Ok(config)
}

fn deploy(args: &DeployArgs) -> i32 {
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ {:#}", e);
            return EXIT_USAGE;
        }
    };

    let host_signal = args.host.clone().unwrap_or_else(host_signal_from_env);
    info!("aura-deploy {} starting (host signal: {})", env!("CARGO_PKG_VERSION"), host_signal);

    let cancel = CancelToken::new();
    if let Err(e) = install_interrupt_handler(cancel.clone()) {
        warn!("Failed to install interrupt handler: {}", e);
    }
    if let Some(secs) = args.run_timeout {
        spawn_run_watchdog(cancel.clone(), Duration::from_secs(secs));
    }

    let options = DeployOptions {
        mode: if args.package_only {
            PipelineMode::PackageOnly
        } else {
            PipelineMode::Full
        },
        parallel: args.parallel,
        host_root: args.host_root.clone(),
        out_dir: args
            .out_dir
            .clone()
            .unwrap_or_else(|| config.workspace_dir.join(&config.out_dir)),
    };

    let orchestrator = Orchestrator::new(config, options).with_cancel(cancel);
    let selection = TargetSelection::from_arg(args.target.as_deref());
    match orchestrator.run(&selection, &host_signal) {
        Ok(summary) => {
            println!("{}", summary);
            summary.exit_code()
        }
        Err(e @ DeployError::UnknownPlatform(_)) => {
            eprintln!("✗ {}", e);
            EXIT_USAGE
        }
        Err(e) => {
            error!("Deployment aborted: {}", e);
            eprintln!("✗ Deployment aborted: {}", e);
            EXIT_FAILURE
        }
    }
}

fn render(target: &str, config_path: Option<&Path>) -> i32 {
    let result = (|| -> Result<String> {
        let config = load_config(config_path)?;
        let target = parse_target(target)?;
        let triple = config.cargo_targets.get(&target).map(String::as_str);

        let artifacts: Vec<BuildArtifact> = config
            .binaries
            .iter()
            .map(|binary| BuildArtifact {
                name: binary.name.clone(),
                path: output_path(&config.workspace_dir, &binary.name, target, triple),
                mode: EXECUTABLE_MODE,
                service: binary.service,
                args: binary.args.clone(),
            })
            .collect();
        let root = assemble(&artifacts, target, &config);

        let mut out = format!("{}\n", root);
        out.push_str("\n--- pre-install hook ---\n");
        out.push_str(&root.hooks.pre_install);
        out.push_str("\n--- post-install hook ---\n");
        out.push_str(&root.hooks.post_install);
        for (entry, content) in root.inline_entries() {
            out.push_str(&format!("\n--- {} ---\n{}", entry.dest, content));
        }
        Ok(out)
    })();

    match result {
        Ok(text) => {
            print!("{}", text);
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("✗ {:#}", e);
            EXIT_USAGE
        }
    }
}

fn validate(path: &PathBuf) -> i32 {
    info!("Validating configuration file: {:?}", path);
    match load_config(Some(path)) {
        Ok(config) => {
            println!(
                "✓ Configuration file is valid: {} {} ({} binaries, {} services)",
                config.app,
                config.version,
                config.binaries.len(),
                config.service_binaries().count()
            );
            EXIT_SUCCESS
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            eprintln!("✗ Configuration validation failed: {:#}", e);
            EXIT_USAGE
        }
    }
}
