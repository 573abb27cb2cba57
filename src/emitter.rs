//! Package emission
//!
//! Materializes an [`InstallRoot`] into a per-run staging directory, lays
//! the hooks out where the native tool expects them, and invokes the tool:
//!
//! | Mechanism | Hooks | Tool |
//! |---|---|---|
//! | deb | `DEBIAN/preinst`, `DEBIAN/postinst`, `DEBIAN/control` | `dpkg-deb --build` |
//! | pkg | `scripts/preinstall`, `scripts/postinstall` | `pkgbuild` |
//! | msi | `hooks/*.ps1`, referenced through `-d` variables | `wix build` |

use crate::assembler::{HOOK_MODE, InstallRoot, set_mode};
use crate::command::{CommandRunner, ToolArgs};
use crate::config::DeployConfig;
use crate::descriptor::xml_escape;
use crate::error::StageFailure;
use crate::platform::PackagingMechanism;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Type-safe arguments for `dpkg-deb --build`
#[derive(Debug, Clone)]
pub struct DpkgDebArgs {
    pub root: PathBuf,
    pub output: PathBuf,
}

impl ToolArgs for DpkgDebArgs {
    fn program(&self) -> &'static str {
        "dpkg-deb"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--root-owner-group".to_string(),
            "--build".to_string(),
            self.root.display().to_string(),
            self.output.display().to_string(),
        ]
    }
}

/// Type-safe arguments for `pkgbuild`
#[derive(Debug, Clone)]
pub struct PkgbuildArgs {
    pub root: PathBuf,
    pub scripts: PathBuf,
    pub identifier: String,
    pub version: String,
    pub output: PathBuf,
}

impl ToolArgs for PkgbuildArgs {
    fn program(&self) -> &'static str {
        "pkgbuild"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--root".to_string(),
            self.root.display().to_string(),
            "--scripts".to_string(),
            self.scripts.display().to_string(),
            "--identifier".to_string(),
            self.identifier.clone(),
            "--version".to_string(),
            self.version.clone(),
            "--install-location".to_string(),
            "/".to_string(),
            self.output.display().to_string(),
        ]
    }
}

/// Type-safe arguments for `wix build`
#[derive(Debug, Clone)]
pub struct WixBuildArgs {
    pub source: PathBuf,
    /// Preprocessor variables (`-d NAME=VALUE`)
    pub defines: Vec<(String, String)>,
    pub output: PathBuf,
}

impl ToolArgs for WixBuildArgs {
    fn program(&self) -> &'static str {
        "wix"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["build".to_string(), self.source.display().to_string()];
        for (name, value) in &self.defines {
            args.push("-d".to_string());
            args.push(format!("{}={}", name, value));
        }
        args.push("-arch".to_string());
        args.push("x64".to_string());
        args.push("-o".to_string());
        args.push(self.output.display().to_string());
        args
    }
}

/// Staging directory for this process and target
pub fn staging_dir(out_dir: &Path, root: &InstallRoot) -> PathBuf {
    out_dir
        .join("staging")
        .join(format!("{}-{}", root.target, std::process::id()))
}

/// Package file name, e.g. `aura-0.1.0.deb`
pub fn package_file_name(config: &DeployConfig, mechanism: PackagingMechanism) -> String {
    format!("{}-{}.{}", config.app, config.version, mechanism.extension())
}

/// Emit the native package for `root` into `out_dir`
pub fn emit(
    root: &InstallRoot,
    config: &DeployConfig,
    out_dir: &Path,
    runner: &dyn CommandRunner,
) -> Result<PathBuf, StageFailure> {
    let mechanism = root.target.packaging();
    let staging = staging_dir(out_dir, root);
    let output = out_dir.join(package_file_name(config, mechanism));

    let invocation = stage(root, config, mechanism, &staging, &output)
        .map_err(|e| StageFailure::Packaging(format!("staging {}: {}", staging.display(), e)))?;
    debug!("Staged {} package in {}", mechanism, staging.display());

    let result = runner
        .run(&invocation)
        .map_err(|e| StageFailure::Packaging(format!("{:#}", e)))?;
    if !result.success {
        return Err(StageFailure::Packaging(result.diagnostic()));
    }

    info!("Packaged {} -> {}", root.target, output.display());
    Ok(output)
}

/// Lay out the staging directory and describe the tool call
fn stage(
    root: &InstallRoot,
    config: &DeployConfig,
    mechanism: PackagingMechanism,
    staging: &Path,
    output: &Path,
) -> io::Result<crate::command::Invocation> {
    if staging.exists() {
        fs::remove_dir_all(staging)?;
    }
    let tree = staging.join("root");
    fs::create_dir_all(&tree)?;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    root.materialize(&tree)?;

    let invocation = match mechanism {
        PackagingMechanism::Deb => {
            let debian = tree.join("DEBIAN");
            fs::create_dir_all(&debian)?;
            fs::write(debian.join("control"), deb_control(config))?;
            write_hook(&debian.join("preinst"), &root.hooks.pre_install)?;
            write_hook(&debian.join("postinst"), &root.hooks.post_install)?;
            DpkgDebArgs {
                root: tree,
                output: output.to_path_buf(),
            }
            .invocation()
        }
        PackagingMechanism::Pkg => {
            let scripts = staging.join("scripts");
            fs::create_dir_all(&scripts)?;
            write_hook(&scripts.join("preinstall"), &root.hooks.pre_install)?;
            write_hook(&scripts.join("postinstall"), &root.hooks.post_install)?;
            PkgbuildArgs {
                root: tree,
                scripts,
                identifier: format!("{}.{}", config.identifier_prefix, config.app),
                version: config.version.clone(),
                output: output.to_path_buf(),
            }
            .invocation()
        }
        PackagingMechanism::Msi => {
            let hooks = staging.join("hooks");
            fs::create_dir_all(&hooks)?;
            let pre = hooks.join("preinstall.ps1");
            let post = hooks.join("postinstall.ps1");
            write_hook(&pre, &root.hooks.pre_install)?;
            write_hook(&post, &root.hooks.post_install)?;
            let source = staging.join(format!("{}.wxs", config.app));
            fs::write(&source, wix_source(root, config))?;
            WixBuildArgs {
                source,
                defines: vec![
                    ("StagingRoot".to_string(), tree.display().to_string()),
                    ("PreInstallHook".to_string(), pre.display().to_string()),
                    ("PostInstallHook".to_string(), post.display().to_string()),
                ],
                output: output.to_path_buf(),
            }
            .invocation()
        }
    };
    Ok(invocation)
}

fn write_hook(path: &Path, content: &str) -> io::Result<()> {
    fs::write(path, content)?;
    set_mode(path, HOOK_MODE)
}

fn deb_control(config: &DeployConfig) -> String {
    let linux_triple = config.cargo_targets.get(&crate::platform::PlatformTarget::Linux);
    let architecture = deb_architecture(linux_triple);
    format!(
        "Package: {app}\n\
         Version: {version}\n\
         Section: database\n\
         Priority: optional\n\
         Architecture: {architecture}\n\
         Maintainer: {maintainer}\n\
         Description: {description}\n",
        app = config.app,
        version = config.version,
        architecture = architecture,
        maintainer = config.maintainer,
        description = config.description,
    )
}

/// Debian architecture for a cargo triple (host architecture when none)
fn deb_architecture(triple: Option<&String>) -> &'static str {
    let arch = triple
        .and_then(|triple| triple.split('-').next())
        .unwrap_or(std::env::consts::ARCH);
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" | "armv7" => "armhf",
        "x86" | "i686" | "i586" => "i386",
        "riscv64gc" | "riscv64" => "riscv64",
        _ => "all",
    }
}

/// WiX v4 source installing every entry and running the hooks after files
/// are in place
fn wix_source(root: &InstallRoot, config: &DeployConfig) -> String {
    let mut components = String::new();
    for (index, entry) in root.entries.iter().enumerate() {
        let directory = if entry.dest.as_str().starts_with(root.layout.bin_dir.as_str()) {
            "BINDIR"
        } else {
            "SERVICEDIR"
        };
        components.push_str(&format!(
            "      <Component Directory=\"{directory}\"><File Id=\"Payload{index}\" Source=\"$(var.StagingRoot)\\{source}\" /></Component>\n",
            directory = directory,
            index = index,
            source = xml_escape(&entry.dest.staging_relative().display().to_string()),
        ));
    }
    let hook_command = |variable: &str| {
        xml_escape(&format!(
            "\"powershell.exe\" -NoProfile -ExecutionPolicy Bypass -File \"$(var.{})\"",
            variable
        ))
    };

    format!(
        "<Wix xmlns=\"http://wixtoolset.org/schemas/v4/wxs\" xmlns:util=\"http://wixtoolset.org/schemas/v4/wxs/util\">\n\
         \x20 <Package Name=\"{app}\" Version=\"{version}\" Manufacturer=\"{maintainer}\" UpgradeCode=\"{upgrade_code}\" Scope=\"perMachine\">\n\
         \x20   <MajorUpgrade DowngradeErrorMessage=\"A newer version of {app} is already installed.\" />\n\
         \x20   <MediaTemplate EmbedCab=\"yes\" />\n\
         \x20   <StandardDirectory Id=\"ProgramFiles64Folder\">\n\
         \x20     <Directory Id=\"INSTALLDIR\" Name=\"{app}\"><Directory Id=\"BINDIR\" Name=\"bin\" /></Directory>\n\
         \x20   </StandardDirectory>\n\
         \x20   <StandardDirectory Id=\"CommonAppDataFolder\">\n\
         \x20     <Directory Id=\"APPDATADIR\" Name=\"{app}\"><Directory Id=\"SERVICEDIR\" Name=\"service\" /></Directory>\n\
         \x20   </StandardDirectory>\n\
         \x20   <ComponentGroup Id=\"Payload\">\n\
         {components}\
         \x20   </ComponentGroup>\n\
         \x20   <Feature Id=\"Main\"><ComponentGroupRef Id=\"Payload\" /></Feature>\n\
         \x20   <SetProperty Id=\"PreInstallHook\" Value=\"{pre}\" Before=\"PreInstallHook\" Sequence=\"execute\" />\n\
         \x20   <CustomAction Id=\"PreInstallHook\" BinaryRef=\"Wix4UtilCA_X64\" DllEntry=\"WixQuietExec\" Execute=\"deferred\" Impersonate=\"no\" Return=\"check\" />\n\
         \x20   <SetProperty Id=\"PostInstallHook\" Value=\"{post}\" Before=\"PostInstallHook\" Sequence=\"execute\" />\n\
         \x20   <CustomAction Id=\"PostInstallHook\" BinaryRef=\"Wix4UtilCA_X64\" DllEntry=\"WixQuietExec\" Execute=\"deferred\" Impersonate=\"no\" Return=\"check\" />\n\
         \x20   <InstallExecuteSequence>\n\
         \x20     <Custom Action=\"PreInstallHook\" After=\"InstallFiles\" Condition=\"NOT REMOVE\" />\n\
         \x20     <Custom Action=\"PostInstallHook\" After=\"PreInstallHook\" Condition=\"NOT REMOVE\" />\n\
         \x20   </InstallExecuteSequence>\n\
         \x20 </Package>\n\
         </Wix>\n",
        app = xml_escape(&config.app),
        version = xml_escape(&config.version),
        maintainer = xml_escape(&config.maintainer),
        upgrade_code = upgrade_code(&config.identifier_prefix, &config.app),
        components = components,
        pre = hook_command("PreInstallHook"),
        post = hook_command("PostInstallHook"),
    )
}

/// Stable GUID derived from the package identity, so upgrades replace
/// earlier installs
fn upgrade_code(prefix: &str, app: &str) -> String {
    // FNV-1a, twice with different offsets for 128 bits
    let hash = |offset: u64| {
        format!("{}.{}", prefix, app)
            .bytes()
            .fold(offset, |acc, byte| (acc ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3))
    };
    let hi = hash(0xcbf2_9ce4_8422_2325);
    let lo = hash(0x8422_2325_cbf2_9ce4);
    format!(
        "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
        hi >> 32,
        (hi >> 16) & 0xffff,
        hi & 0xffff,
        lo >> 48,
        lo & 0xffff_ffff_ffff
    )
}
