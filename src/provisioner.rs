//! Principal provisioning (pre-install step)
//!
//! Creates the dedicated low-privilege system principal the service runs
//! as, plus the data and log directories it owns.
//!
//! # Invariants
//!
//! - Running [`provision`] any number of times yields the same end state as
//!   running it once. An existing principal is reused, never recreated.
//! - New numeric ids are `max assigned + 1`, clamped up to
//!   [`RESERVED_ID_FLOOR`] on platforms with numeric ids.
//! - Directory owner and mode are re-applied on every run, whether or not
//!   the directory already existed: data `700`, log `755`.
//!
//! # Failure Policy
//!
//! Any failure here is **fatal** for the target. Packaging and registration
//! never run against an unverified principal.

use crate::command::{CommandRunner, Invocation};
use crate::error::StageFailure;
use crate::platform::{InstallLayout, PlatformTarget, TargetPath};
use anyhow::{Context, anyhow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Lowest numeric id handed to a new principal
pub const RESERVED_ID_FLOOR: u32 = 500;
/// Owner-only
pub const DATA_DIR_MODE: u32 = 0o700;
/// Owner-writable, group/other-readable
pub const LOG_DIR_MODE: u32 = 0o755;
/// Attempts at creating a principal when its computed id turns out taken
pub const MAX_CREATE_ATTEMPTS: usize = 3;

/// Ids at or above this are overflow/nobody accounts, not real assignments
const OVERFLOW_ID: u32 = 65534;

/// A dedicated service identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPrincipal {
    pub name: String,
    pub home: TargetPath,
    /// `None` where the platform assigns opaque identifiers (Windows SIDs)
    pub id: Option<u32>,
}

impl SystemPrincipal {
    /// Principals never get a login shell
    pub const fn shell_disabled(&self) -> bool {
        true
    }
}

/// A directory owned by the principal with a fixed mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedDirectory {
    pub path: TargetPath,
    pub owner: String,
    pub mode: u32,
}

/// The data and log directories for `principal` under `layout`
pub fn service_directories(layout: &InstallLayout, principal: &str) -> Vec<ProvisionedDirectory> {
    vec![
        ProvisionedDirectory {
            path: layout.data_dir.clone(),
            owner: principal.to_string(),
            mode: DATA_DIR_MODE,
        },
        ProvisionedDirectory {
            path: layout.log_dir.clone(),
            owner: principal.to_string(),
            mode: LOG_DIR_MODE,
        },
    ]
}

/// Why a principal could not be created
#[derive(Error, Debug)]
pub enum CreateError {
    /// The computed id was taken between query and creation
    #[error("id {0} is already assigned")]
    IdConflict(u32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Account and filesystem operations provisioning needs from a host
pub trait ProvisionHost: Send + Sync {
    /// Look up an existing principal by name. `default_home` is reported
    /// only when the account database records no home for it.
    fn lookup_principal(
        &self,
        name: &str,
        default_home: &TargetPath,
    ) -> anyhow::Result<Option<SystemPrincipal>>;

    /// Highest numeric id currently assigned (0 when none)
    fn max_assigned_id(&self) -> anyhow::Result<u32>;

    /// Create the principal with shell disabled
    fn create_principal(&self, principal: &SystemPrincipal) -> Result<(), CreateError>;

    /// Create the directory if absent; returns true if it was created
    fn ensure_directory(&self, path: &TargetPath) -> anyhow::Result<bool>;

    /// Apply owner and mode unconditionally
    fn apply_ownership(&self, dir: &ProvisionedDirectory) -> anyhow::Result<()>;
}

/// Next id to assign: one past the current maximum, never below the floor
pub fn next_principal_id(max_assigned: u32) -> u32 {
    max_assigned.saturating_add(1).max(RESERVED_ID_FLOOR)
}

/// Provision `name` (home = `home`) and `dirs` on `host`.
pub fn provision(
    host: &dyn ProvisionHost,
    id_sensitive: bool,
    name: &str,
    home: &TargetPath,
    dirs: &[ProvisionedDirectory],
) -> Result<SystemPrincipal, StageFailure> {
    let principal = ensure_principal(host, id_sensitive, name, home)?;

    for dir in dirs {
        let created = host
            .ensure_directory(&dir.path)
            .map_err(|e| StageFailure::directory(format!("{}: {:#}", dir.path, e)))?;
        host.apply_ownership(dir)
            .map_err(|e| StageFailure::directory(format!("{}: {:#}", dir.path, e)))?;
        info!(
            "Directory {} {} (owner={}, mode={:o})",
            dir.path,
            if created { "created" } else { "corrected" },
            dir.owner,
            dir.mode
        );
    }

    Ok(principal)
}

fn ensure_principal(
    host: &dyn ProvisionHost,
    id_sensitive: bool,
    name: &str,
    home: &TargetPath,
) -> Result<SystemPrincipal, StageFailure> {
    let lookup = || {
        host.lookup_principal(name, home)
            .map_err(|e| StageFailure::principal(format!("querying '{}': {:#}", name, e)))
    };

    if let Some(existing) = lookup()? {
        info!("Principal '{}' already exists (id={:?}), reusing", name, existing.id);
        return Ok(existing);
    }

    for attempt in 1..=MAX_CREATE_ATTEMPTS {
        let id = if id_sensitive {
            let max = host
                .max_assigned_id()
                .map_err(|e| StageFailure::principal(format!("reading assigned ids: {:#}", e)))?;
            Some(next_principal_id(max))
        } else {
            None
        };
        let principal = SystemPrincipal {
            name: name.to_string(),
            home: home.clone(),
            id,
        };

        match host.create_principal(&principal) {
            Ok(()) => {
                info!("Created principal '{}' (id={:?}, home={})", name, id, home);
                return Ok(principal);
            }
            Err(CreateError::IdConflict(taken)) => {
                warn!(
                    "Principal id {} was taken before '{}' could be created (attempt {}/{})",
                    taken, name, attempt, MAX_CREATE_ATTEMPTS
                );
                // Someone may have created the same principal meanwhile
                if let Some(existing) = lookup()? {
                    return Ok(existing);
                }
            }
            Err(CreateError::Other(e)) => {
                return Err(StageFailure::principal(format!("creating '{}': {:#}", name, e)));
            }
        }
    }

    Err(StageFailure::principal(format!(
        "creating '{}': id conflict persisted after {} attempts",
        name, MAX_CREATE_ATTEMPTS
    )))
}

/// Provisioning against the real host, via native account tools.
///
/// Directories live under `host_root` (normally `/`); tests point it at a
/// temporary directory.
pub struct CommandHost {
    target: PlatformTarget,
    runner: Arc<dyn CommandRunner>,
    host_root: PathBuf,
}

impl CommandHost {
    pub fn new(
        target: PlatformTarget,
        runner: Arc<dyn CommandRunner>,
        host_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            target,
            runner,
            host_root: host_root.into(),
        }
    }

    fn host_path(&self, path: &TargetPath) -> PathBuf {
        self.host_root.join(path.staging_relative())
    }

    fn powershell(command: String) -> Invocation {
        Invocation::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command"])
            .arg(command)
    }
}

impl ProvisionHost for CommandHost {
    fn lookup_principal(
        &self,
        name: &str,
        default_home: &TargetPath,
    ) -> anyhow::Result<Option<SystemPrincipal>> {
        match self.target {
            PlatformTarget::Linux => {
                let output = self.runner.run(&Invocation::new("getent").args(["passwd", name]))?;
                match output.exit_code {
                    Some(0) => parse_passwd_entry(&output.stdout).map(Some),
                    // getent: key not found
                    Some(2) => Ok(None),
                    _ => Err(anyhow!("getent failed: {}", output.diagnostic())),
                }
            }
            PlatformTarget::MacOs => {
                let record = format!("/Users/{}", name);
                let output = self.runner.run(&Invocation::new("dscl").args([
                    ".",
                    "-read",
                    &record,
                    "UniqueID",
                    "NFSHomeDirectory",
                ]))?;
                if !output.success {
                    return Ok(None);
                }
                let id =
                    dscl_attribute(&output.stdout, "UniqueID").and_then(|raw| raw.parse().ok());
                let home = dscl_attribute(&output.stdout, "NFSHomeDirectory")
                    .map(|raw| TargetPath::native(self.target, raw))
                    .unwrap_or_else(|| default_home.clone());
                Ok(Some(SystemPrincipal {
                    name: name.to_string(),
                    home,
                    id,
                }))
            }
            PlatformTarget::Windows => {
                let output = self
                    .runner
                    .run(&Self::powershell(format!("Get-LocalUser -Name '{}'", name)))?;
                // Local accounts carry no home of their own until a profile exists
                Ok(output.success.then(|| SystemPrincipal {
                    name: name.to_string(),
                    home: default_home.clone(),
                    id: None,
                }))
            }
        }
    }

    fn max_assigned_id(&self) -> anyhow::Result<u32> {
        let (invocation, column, separator) = match self.target {
            PlatformTarget::Linux => (Invocation::new("getent").arg("passwd"), 2, Some(':')),
            PlatformTarget::MacOs => (
                Invocation::new("dscl").args([".", "-list", "/Users", "UniqueID"]),
                1,
                None,
            ),
            PlatformTarget::Windows => return Ok(0),
        };
        let output = self.runner.run_checked(&invocation)?;
        Ok(max_id_in_listing(&output.stdout, column, separator))
    }

    fn create_principal(&self, principal: &SystemPrincipal) -> Result<(), CreateError> {
        let home = principal.home.as_str();
        match (self.target, principal.id) {
            (PlatformTarget::Linux, Some(id)) => {
                let output = self.runner.run(&Invocation::new("useradd").args([
                    "--system",
                    "--uid",
                    &id.to_string(),
                    "--user-group",
                    "--home-dir",
                    home,
                    "--no-create-home",
                    "--shell",
                    "/usr/sbin/nologin",
                    &principal.name,
                ]))?;
                match output.exit_code {
                    Some(0) => Ok(()),
                    // useradd: UID already in use
                    Some(4) => Err(CreateError::IdConflict(id)),
                    _ => Err(anyhow!("useradd failed: {}", output.diagnostic()).into()),
                }
            }
            (PlatformTarget::MacOs, Some(id)) => {
                let id_text = id.to_string();
                let taken = self.runner.run_checked(
                    &Invocation::new("dscl").args([".", "-search", "/Users", "UniqueID", &id_text]),
                )?;
                if !taken.stdout.trim().is_empty() {
                    return Err(CreateError::IdConflict(id));
                }
                let user = format!("/Users/{}", principal.name);
                let group = format!("/Groups/{}", principal.name);
                let steps: [(&str, &str, &str); 6] = [
                    (&group, "PrimaryGroupID", &id_text),
                    (&user, "UniqueID", &id_text),
                    (&user, "PrimaryGroupID", &id_text),
                    (&user, "UserShell", "/usr/bin/false"),
                    (&user, "NFSHomeDirectory", home),
                    (&user, "IsHidden", "1"),
                ];
                for (record, key, value) in steps {
                    let create = Invocation::new("dscl").args([".", "-create", record, key, value]);
                    self.runner.run_checked(&create).context("dscl -create")?;
                }
                Ok(())
            }
            (PlatformTarget::Windows, _) => {
                self.runner
                    .run_checked(&Self::powershell(format!(
                        "New-LocalUser -Name '{}' -NoPassword -AccountNeverExpires -UserMayNotChangePassword",
                        principal.name
                    )))
                    .context("New-LocalUser")?;
                Ok(())
            }
            (_, None) => Err(anyhow!("{} principals need a numeric id", self.target).into()),
        }
    }

    fn ensure_directory(&self, path: &TargetPath) -> anyhow::Result<bool> {
        let host_path = self.host_path(path);
        if host_path.is_dir() {
            return Ok(false);
        }
        std::fs::create_dir_all(&host_path)
            .with_context(|| format!("creating {}", host_path.display()))?;
        Ok(true)
    }

    fn apply_ownership(&self, dir: &ProvisionedDirectory) -> anyhow::Result<()> {
        let host_path = self.host_path(&dir.path);
        let path_text = host_path.display().to_string();
        match self.target {
            PlatformTarget::Linux | PlatformTarget::MacOs => {
                self.runner
                    .run_checked(&Invocation::new("chown").args([dir.owner.as_str(), &path_text]))?;
                apply_mode(&host_path, dir.mode)
            }
            PlatformTarget::Windows => {
                let mut args = vec![
                    path_text,
                    "/setowner".to_string(),
                    dir.owner.clone(),
                    "/inheritance:r".to_string(),
                    "/grant:r".to_string(),
                    format!("{}:(OI)(CI)F", dir.owner),
                    "SYSTEM:(OI)(CI)F".to_string(),
                    "Administrators:(OI)(CI)F".to_string(),
                ];
                // Group/other read maps to the built-in Users group
                if dir.mode & 0o005 == 0o005 {
                    args.push("Users:(OI)(CI)RX".to_string());
                }
                self.runner.run_checked(&Invocation::new("icacls").args(args))?;
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {:o} {}", mode, path.display()))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}

/// Parse `name:x:uid:gid:gecos:home:shell`
fn parse_passwd_entry(line: &str) -> anyhow::Result<SystemPrincipal> {
    let fields: Vec<&str> = line.trim().split(':').collect();
    if fields.len() < 7 {
        return Err(anyhow!("malformed passwd entry: {}", line.trim()));
    }
    let id = fields[2]
        .parse()
        .with_context(|| format!("malformed uid in passwd entry: {}", fields[2]))?;
    Ok(SystemPrincipal {
        name: fields[0].to_string(),
        home: TargetPath::native(PlatformTarget::Linux, fields[5]),
        id: Some(id),
    })
}

/// Value of `key` in `dscl -read` output. Values containing spaces are
/// printed on the line after the key.
fn dscl_attribute<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    let mut lines = output.lines();
    while let Some(line) = lines.next() {
        let Some(value) = line.strip_prefix(key).and_then(|rest| rest.strip_prefix(':')) else {
            continue;
        };
        let value = value.trim();
        if !value.is_empty() {
            return Some(value);
        }
        return lines.next().map(str::trim).filter(|next| !next.is_empty());
    }
    None
}

/// Highest id in a listing, ignoring overflow ids (nobody, nfsnobody)
fn max_id_in_listing(listing: &str, column: usize, separator: Option<char>) -> u32 {
    listing
        .lines()
        .filter_map(|line| match separator {
            Some(sep) => line.split(sep).nth(column).map(str::to_string),
            None => line.split_whitespace().nth(column).map(str::to_string),
        })
        .filter_map(|raw| raw.trim().parse::<u32>().ok())
        .filter(|&id| id < OVERFLOW_ID)
        .max()
        .unwrap_or(0)
}
