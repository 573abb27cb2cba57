//! Install root assembly
//!
//! An [`InstallRoot`] describes everything a target installs: destination
//! paths on the target system, where each file's bytes come from, owner and
//! mode, plus the hooks the package runs. Assembly is pure; only
//! [`InstallRoot::materialize`] touches the filesystem.

use crate::builder::BuildArtifact;
use crate::config::DeployConfig;
use crate::descriptor::ServiceDescriptor;
use crate::hooks::{HookScripts, render_hooks};
use crate::platform::{InstallLayout, PlatformTarget, TargetPath};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Mode of rendered service descriptors
pub const DESCRIPTOR_MODE: u32 = 0o644;
/// Mode of hook scripts
pub const HOOK_MODE: u32 = 0o755;

/// Where an entry's bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    /// A file produced by the build
    Artifact(PathBuf),
    /// Content rendered in memory
    Inline(String),
}

/// One installed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallEntry {
    pub dest: TargetPath,
    pub source: EntrySource,
    pub owner: String,
    pub mode: u32,
}

/// Everything one target installs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRoot {
    pub target: PlatformTarget,
    pub layout: InstallLayout,
    /// Principal the services run as and that owns the data/log dirs
    pub principal: String,
    pub entries: Vec<InstallEntry>,
    pub services: Vec<ServiceDescriptor>,
    pub hooks: HookScripts,
}

/// Owner of installed files (not the service principal)
fn system_owner(target: PlatformTarget) -> &'static str {
    match target {
        PlatformTarget::Linux | PlatformTarget::MacOs => "root",
        PlatformTarget::Windows => "Administrators",
    }
}

/// Assemble the install root for `target` from built artifacts
pub fn assemble(
    artifacts: &[BuildArtifact],
    target: PlatformTarget,
    config: &DeployConfig,
) -> InstallRoot {
    let layout = target.layout(&config.app);
    let principal = config.principal_for(target);
    let owner = system_owner(target).to_string();
    let dialect = target.dialect();

    let mut entries: Vec<InstallEntry> = artifacts
        .iter()
        .map(|artifact| InstallEntry {
            dest: layout.bin_dir.join(&artifact.file_name()),
            source: EntrySource::Artifact(artifact.path.clone()),
            owner: owner.clone(),
            mode: artifact.mode,
        })
        .collect();

    let services: Vec<ServiceDescriptor> = artifacts
        .iter()
        .filter(|artifact| artifact.service)
        .map(|artifact| {
            ServiceDescriptor::for_binary(config, target, &artifact.name, &artifact.args)
        })
        .collect();

    entries.extend(services.iter().map(|service| InstallEntry {
        dest: layout.descriptor_dir.join(&service.file_name(dialect)),
        source: EntrySource::Inline(service.render(dialect)),
        owner: owner.clone(),
        mode: DESCRIPTOR_MODE,
    }));

    let hooks = render_hooks(target, &principal, &layout, &services);

    InstallRoot {
        target,
        layout,
        principal,
        entries,
        services,
        hooks,
    }
}

impl InstallRoot {
    /// Write every entry beneath `root_dir`, mirroring target paths.
    ///
    /// Modes are applied on Unix hosts; ownership is left to the packaging
    /// tool or the provisioner. Returns the written paths.
    pub fn materialize(&self, root_dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let path = root_dir.join(entry.dest.staging_relative());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            match &entry.source {
                EntrySource::Artifact(source) => {
                    fs::copy(source, &path)?;
                }
                EntrySource::Inline(content) => fs::write(&path, content)?,
            }
            set_mode(&path, entry.mode)?;
            written.push(path);
        }
        Ok(written)
    }

    /// Entries rendered inline (descriptors)
    pub fn inline_entries(&self) -> impl Iterator<Item = (&InstallEntry, &str)> {
        self.entries.iter().filter_map(|entry| match &entry.source {
            EntrySource::Inline(content) => Some((entry, content.as_str())),
            EntrySource::Artifact(_) => None,
        })
    }
}

impl fmt::Display for InstallRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "install root for {} (principal {})", self.target, self.principal)?;
        for entry in &self.entries {
            let source = match &entry.source {
                EntrySource::Artifact(path) => path.display().to_string(),
                EntrySource::Inline(_) => "<inline>".to_string(),
            };
            writeln!(f, "  {:o} {:<14} {}  <- {}", entry.mode, entry.owner, entry.dest, source)?;
        }
        writeln!(f, "  {:o} data dir {}", crate::provisioner::DATA_DIR_MODE, self.layout.data_dir)?;
        write!(f, "  {:o} log dir  {}", crate::provisioner::LOG_DIR_MODE, self.layout.log_dir)
    }
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
