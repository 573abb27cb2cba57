//! Platform target resolution
//!
//! Classifies the host (or an explicitly requested target) into one of the
//! three supported platform families. Each family knows its native packaging
//! mechanism, its service-manager dialect, and where things get installed.
//!
//! The host signal is always passed in as a parameter. Nothing in here reads
//! the environment except [`host_signal_from_env`], which `main` calls once.

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Environment variable that overrides the detected host signal
pub const HOST_SIGNAL_ENV: &str = "AURA_DEPLOY_HOST";

/// Supported platform families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum PlatformTarget {
    #[strum(to_string = "linux")]
    Linux,
    #[strum(to_string = "windows", serialize = "win")]
    Windows,
    #[strum(to_string = "macos", serialize = "mac", serialize = "darwin", serialize = "osx")]
    MacOs,
}

/// Native mechanism that turns a staged tree into one installable unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum PackagingMechanism {
    /// Debian package built with `dpkg-deb`
    Deb,
    /// Windows installer built with the WiX toolset
    Msi,
    /// macOS flat package built with `pkgbuild`
    Pkg,
}

impl PackagingMechanism {
    /// Program invoked to build the package
    pub const fn tool(self) -> &'static str {
        match self {
            Self::Deb => "dpkg-deb",
            Self::Msi => "wix",
            Self::Pkg => "pkgbuild",
        }
    }

    /// File extension of the produced package
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Deb => "deb",
            Self::Msi => "msi",
            Self::Pkg => "pkg",
        }
    }
}

/// Native service-manager dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ServiceDialect {
    Systemd,
    Launchd,
    /// Windows Service Control Manager
    Scm,
}

impl ServiceDialect {
    /// File extension of a rendered descriptor
    pub const fn descriptor_extension(self) -> &'static str {
        match self {
            Self::Systemd => "service",
            Self::Launchd => "plist",
            Self::Scm => "xml",
        }
    }
}

/// An absolute path on the *target* system.
///
/// Kept apart from `PathBuf` because a Windows install layout must render
/// with backslashes even when assembled on a Linux build host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetPath {
    raw: String,
    separator: char,
}

impl TargetPath {
    fn new(raw: impl Into<String>, separator: char) -> Self {
        Self {
            raw: raw.into(),
            separator,
        }
    }

    /// A path reported by `target` itself, in its own spelling
    pub fn native(target: PlatformTarget, raw: impl Into<String>) -> Self {
        let separator = match target {
            PlatformTarget::Windows => '\\',
            PlatformTarget::Linux | PlatformTarget::MacOs => '/',
        };
        Self::new(raw, separator)
    }

    /// Append one path segment
    pub fn join(&self, segment: &str) -> Self {
        let base = self.raw.trim_end_matches(self.separator);
        Self::new(format!("{}{}{}", base, self.separator, segment), self.separator)
    }

    /// The path as the target system spells it
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Last segment of the path
    pub fn file_name(&self) -> &str {
        self.raw.rsplit(self.separator).next().unwrap_or(&self.raw)
    }

    /// The path relative to the target's filesystem root, for staging trees.
    ///
    /// `/usr/bin/aura` → `usr/bin/aura`, `C:\Program Files\aura` → `Program Files/aura`.
    pub fn staging_relative(&self) -> PathBuf {
        let without_drive = match self.raw.split_once(':') {
            Some((drive, rest)) if drive.len() == 1 => rest,
            _ => self.raw.as_str(),
        };
        without_drive
            .split(self.separator)
            .filter(|segment| !segment.is_empty())
            .collect()
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Default install locations for one application on one platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub bin_dir: TargetPath,
    pub data_dir: TargetPath,
    pub log_dir: TargetPath,
    pub descriptor_dir: TargetPath,
}

impl PlatformTarget {
    /// All supported families, in a stable order
    pub fn all() -> Vec<Self> {
        Self::iter().collect()
    }

    pub const fn packaging(self) -> PackagingMechanism {
        match self {
            Self::Linux => PackagingMechanism::Deb,
            Self::Windows => PackagingMechanism::Msi,
            Self::MacOs => PackagingMechanism::Pkg,
        }
    }

    pub const fn dialect(self) -> ServiceDialect {
        match self {
            Self::Linux => ServiceDialect::Systemd,
            Self::Windows => ServiceDialect::Scm,
            Self::MacOs => ServiceDialect::Launchd,
        }
    }

    /// Whether principals carry a numeric id that must stay above the
    /// reserved range
    pub const fn id_sensitive(self) -> bool {
        matches!(self, Self::Linux | Self::MacOs)
    }

    /// Suffix appended to executable file names
    pub const fn exe_suffix(self) -> &'static str {
        match self {
            Self::Windows => ".exe",
            Self::Linux | Self::MacOs => "",
        }
    }

    /// Install layout for `app` on this platform
    pub fn layout(self, app: &str) -> InstallLayout {
        match self {
            Self::Linux => InstallLayout {
                bin_dir: TargetPath::new("/usr/bin", '/'),
                data_dir: TargetPath::new("/var/lib", '/').join(app),
                log_dir: TargetPath::new("/var/log", '/').join(app),
                descriptor_dir: TargetPath::new("/lib/systemd/system", '/'),
            },
            Self::MacOs => InstallLayout {
                bin_dir: TargetPath::new("/usr/local/bin", '/'),
                data_dir: TargetPath::new("/usr/local/var/lib", '/').join(app),
                log_dir: TargetPath::new("/usr/local/var/log", '/').join(app),
                descriptor_dir: TargetPath::new("/Library/LaunchDaemons", '/'),
            },
            Self::Windows => {
                let program_files = TargetPath::new(r"C:\Program Files", '\\').join(app);
                let program_data = TargetPath::new(r"C:\ProgramData", '\\').join(app);
                InstallLayout {
                    bin_dir: program_files.join("bin"),
                    data_dir: program_data.join("data"),
                    log_dir: program_data.join("logs"),
                    descriptor_dir: program_data.join("service"),
                }
            }
        }
    }
}

/// Outcome of resolving one requested target against the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The pipeline should run for this target
    Target(PlatformTarget),
    /// Nothing to do; not an error. `target` is `None` when nothing was
    /// requested and the host matches no supported family.
    Skip {
        target: Option<PlatformTarget>,
        reason: String,
    },
}

/// Classify a host signal (`linux`, `linux-gnu`, `darwin23`, `macos`,
/// `windows`, `msys`, `cygwin`, `win32`, ...) into a family.
pub fn classify_host(signal: &str) -> Option<PlatformTarget> {
    let signal = signal.trim().to_ascii_lowercase();
    if signal.is_empty() {
        return None;
    }
    if signal.contains("linux") {
        Some(PlatformTarget::Linux)
    } else if signal.starts_with("darwin") || signal.starts_with("mac") || signal == "osx" {
        Some(PlatformTarget::MacOs)
    } else if signal.starts_with("win")
        || signal.starts_with("msys")
        || signal.starts_with("cygwin")
        || signal.starts_with("mingw")
    {
        Some(PlatformTarget::Windows)
    } else {
        None
    }
}

/// Parse an explicit target name.
pub fn parse_target(name: &str) -> Result<PlatformTarget> {
    name.trim()
        .parse::<PlatformTarget>()
        .map_err(|_| DeployError::UnknownPlatform(name.to_string()))
}

/// Resolve a single (optional) request against the host signal.
///
/// # Errors
///
/// `UnknownPlatform` only when `requested` names no supported family.
pub fn resolve(requested: Option<&str>, host_signal: &str) -> Result<Resolution> {
    let host = classify_host(host_signal);

    let Some(name) = requested else {
        return Ok(match host {
            Some(target) => Resolution::Target(target),
            None => Resolution::Skip {
                target: None,
                reason: format!("host '{}' matches no supported platform", host_signal),
            },
        });
    };

    let target = parse_target(name)?;
    Ok(resolve_target(target, host_signal))
}

/// Resolve an already-parsed target against the host signal
pub fn resolve_target(target: PlatformTarget, host_signal: &str) -> Resolution {
    match classify_host(host_signal) {
        Some(host) if host == target => Resolution::Target(target),
        Some(host) => Resolution::Skip {
            target: Some(target),
            reason: format!("host is {}", host),
        },
        None => Resolution::Skip {
            target: Some(target),
            reason: format!("host '{}' matches no supported platform", host_signal),
        },
    }
}

/// Resolve every supported family against the host signal
pub fn resolve_all(host_signal: &str) -> Vec<Resolution> {
    PlatformTarget::iter()
        .map(|target| resolve_target(target, host_signal))
        .collect()
}

/// Read the host signal once: `AURA_DEPLOY_HOST` if set, else the OS this
/// binary was compiled for.
pub fn host_signal_from_env() -> String {
    std::env::var(HOST_SIGNAL_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_host_signals() {
        assert_eq!(classify_host("linux"), Some(PlatformTarget::Linux));
        assert_eq!(classify_host("linux-gnu"), Some(PlatformTarget::Linux));
        assert_eq!(classify_host("darwin23"), Some(PlatformTarget::MacOs));
        assert_eq!(classify_host("macos"), Some(PlatformTarget::MacOs));
        assert_eq!(classify_host("windows"), Some(PlatformTarget::Windows));
        assert_eq!(classify_host("msys"), Some(PlatformTarget::Windows));
        assert_eq!(classify_host("cygwin"), Some(PlatformTarget::Windows));
        assert_eq!(classify_host("win32"), Some(PlatformTarget::Windows));
        assert_eq!(classify_host("freebsd"), None);
        assert_eq!(classify_host(""), None);
    }

    #[test]
    fn test_parse_target_aliases_case_insensitive() {
        assert_eq!(parse_target("Linux").unwrap(), PlatformTarget::Linux);
        assert_eq!(parse_target("WIN").unwrap(), PlatformTarget::Windows);
        assert_eq!(parse_target("darwin").unwrap(), PlatformTarget::MacOs);
        assert_eq!(parse_target("mac").unwrap(), PlatformTarget::MacOs);
        assert!(matches!(
            parse_target("solaris"),
            Err(DeployError::UnknownPlatform(name)) if name == "solaris"
        ));
    }

    #[test]
    fn test_resolve_explicit_match_and_mismatch() {
        assert_eq!(
            resolve(Some("linux"), "linux-gnu").unwrap(),
            Resolution::Target(PlatformTarget::Linux)
        );
        assert_eq!(
            resolve(Some("macos"), "linux").unwrap(),
            Resolution::Skip {
                target: Some(PlatformTarget::MacOs),
                reason: "host is linux".to_string(),
            }
        );
    }

    #[test]
    fn test_resolve_unknown_explicit_name_is_error() {
        assert!(matches!(
            resolve(Some("plan9"), "linux"),
            Err(DeployError::UnknownPlatform(_))
        ));
    }

    #[test]
    fn test_resolve_inferred_from_host() {
        assert_eq!(
            resolve(None, "darwin22").unwrap(),
            Resolution::Target(PlatformTarget::MacOs)
        );
        assert!(matches!(
            resolve(None, "haiku").unwrap(),
            Resolution::Skip { target: None, .. }
        ));
    }

    #[test]
    fn test_resolve_all_runs_only_matching_family() {
        let resolutions = resolve_all("linux");
        assert_eq!(resolutions.len(), 3);
        let runnable: Vec<_> = resolutions
            .iter()
            .filter(|r| matches!(r, Resolution::Target(_)))
            .collect();
        assert_eq!(runnable, vec![&Resolution::Target(PlatformTarget::Linux)]);
    }

    #[test]
    fn test_windows_layout_uses_backslashes() {
        let layout = PlatformTarget::Windows.layout("aura");
        assert_eq!(layout.bin_dir.as_str(), r"C:\Program Files\aura\bin");
        assert_eq!(layout.data_dir.as_str(), r"C:\ProgramData\aura\data");
        assert_eq!(
            layout.bin_dir.join("aura.exe").staging_relative(),
            PathBuf::from("Program Files/aura/bin/aura.exe")
        );
    }

    #[test]
    fn test_linux_layout_paths() {
        let layout = PlatformTarget::Linux.layout("aura");
        assert_eq!(layout.bin_dir.as_str(), "/usr/bin");
        assert_eq!(layout.data_dir.as_str(), "/var/lib/aura");
        assert_eq!(layout.log_dir.as_str(), "/var/log/aura");
        assert_eq!(
            layout.data_dir.staging_relative(),
            PathBuf::from("var/lib/aura")
        );
        assert_eq!(layout.log_dir.join("server.log").file_name(), "server.log");
    }

    #[test]
    fn test_platform_display_roundtrip() {
        for target in PlatformTarget::all() {
            assert_eq!(parse_target(&target.to_string()).unwrap(), target);
        }
    }
}
