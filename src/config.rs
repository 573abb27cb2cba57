//! Deploy configuration file handling.
//!
//! A deploy configuration names the application, which binaries to build,
//! which of them run as services, the principal they run as, and the
//! service start-verification timing. Everything has a default describing
//! AuraDB, so the file is optional.

use crate::error::{DeployError, Result};
use crate::platform::PlatformTarget;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "aura-deploy.json";

/// One binary produced by the build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinarySpec {
    /// Cargo binary target name (also the installed file name)
    pub name: String,
    /// Whether this binary runs persistently under the service manager
    #[serde(default)]
    pub service: bool,
    /// Arguments passed to the binary when run as a service
    #[serde(default)]
    pub args: Vec<String>,
}

/// Longest accepted service start timeout (one day)
pub const MAX_START_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Service start verification timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceTiming {
    /// Interval between status queries, in milliseconds
    pub poll_interval_ms: u64,
    /// Time allowed for the service to report running, in seconds
    pub start_timeout_secs: u64,
}

impl Default for ServiceTiming {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            start_timeout_secs: 30,
        }
    }
}

impl ServiceTiming {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

/// Deployment configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Application name, used in install paths and package names
    pub app: String,
    /// Package version
    pub version: String,
    /// One-line package description
    pub description: String,
    /// Package maintainer
    pub maintainer: String,
    /// Reverse-DNS prefix for launchd labels and package identifiers
    pub identifier_prefix: String,
    /// Binaries to build and install
    pub binaries: Vec<BinarySpec>,
    /// Name of the dedicated system principal
    pub principal: String,
    /// Start verification timing
    pub service: ServiceTiming,
    /// Directory (relative to the workspace) where packages are written
    pub out_dir: PathBuf,
    /// Cargo workspace the binaries are built from
    pub workspace_dir: PathBuf,
    /// Optional cross-compilation triple per platform
    pub cargo_targets: BTreeMap<PlatformTarget, String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            app: "aura".to_string(),
            version: "0.1.0".to_string(),
            description: "AuraDB encrypted database server and client".to_string(),
            maintainer: "AuraDB Maintainers <maintainers@auradb.dev>".to_string(),
            identifier_prefix: "dev.auradb".to_string(),
            binaries: vec![
                BinarySpec {
                    name: "aura-server".to_string(),
                    service: true,
                    args: vec![],
                },
                BinarySpec {
                    name: "aura".to_string(),
                    service: false,
                    args: vec![],
                },
            ],
            principal: "aura".to_string(),
            service: ServiceTiming::default(),
            out_dir: PathBuf::from("target/deploy"),
            workspace_dir: PathBuf::from("."),
            cargo_targets: BTreeMap::new(),
        }
    }
}

impl DeployConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            DeployError::config(format!(
                "Failed to read configuration from {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if given, else `aura-deploy.json` if present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load_from_file(DEFAULT_CONFIG_FILE)
            }
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_name("App name", &self.app)?;
        if self.version.trim().is_empty() {
            return Err(DeployError::config("Version must be specified"));
        }
        if self.identifier_prefix.trim().is_empty() {
            return Err(DeployError::config("Identifier prefix must be specified"));
        }

        if self.binaries.is_empty() {
            return Err(DeployError::config("At least one binary must be listed"));
        }
        let mut seen = std::collections::HashSet::new();
        for binary in &self.binaries {
            validate_name("Binary name", &binary.name)?;
            if !seen.insert(binary.name.as_str()) {
                return Err(DeployError::config(format!(
                    "Binary '{}' is listed more than once",
                    binary.name
                )));
            }
        }

        validate_name("Principal name", &self.principal)?;
        if self.principal.len() > 31 {
            return Err(DeployError::config(
                "Principal name must be at most 31 characters",
            ));
        }

        if self.service.poll_interval_ms == 0 {
            return Err(DeployError::config("Poll interval must be greater than zero"));
        }
        if self.service.start_timeout_secs > MAX_START_TIMEOUT_SECS {
            return Err(DeployError::config(format!(
                "Start timeout must be at most {} seconds",
                MAX_START_TIMEOUT_SECS
            )));
        }
        if self.service.start_timeout() < self.service.poll_interval() {
            return Err(DeployError::config(
                "Start timeout must be at least one poll interval",
            ));
        }
        Ok(())
    }

    /// Binaries registered with the service manager
    pub fn service_binaries(&self) -> impl Iterator<Item = &BinarySpec> {
        self.binaries.iter().filter(|binary| binary.service)
    }

    /// Principal name on `target`. macOS daemon accounts carry a leading
    /// underscore by convention.
    pub fn principal_for(&self, target: PlatformTarget) -> String {
        match target {
            PlatformTarget::MacOs if !self.principal.starts_with('_') => {
                format!("_{}", self.principal)
            }
            _ => self.principal.clone(),
        }
    }

    /// Service identifier for a binary: systemd/SCM use the binary name,
    /// launchd uses a reverse-DNS label.
    pub fn service_id(&self, target: PlatformTarget, binary: &str) -> String {
        match target {
            PlatformTarget::MacOs => format!("{}.{}", self.identifier_prefix, binary),
            PlatformTarget::Linux | PlatformTarget::Windows => binary.to_string(),
        }
    }
}

/// Names start with a lowercase letter and contain `[a-z0-9_-]` only
fn validate_name(what: &str, name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DeployError::config(format!("{} must be specified", what)));
    }
    if let Some(first_char) = name.chars().next() {
        if !first_char.is_ascii_lowercase() {
            return Err(DeployError::config(format!(
                "{} must start with a lowercase letter",
                what
            )));
        }
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(DeployError::config(format!(
            "{} can only contain lowercase letters, digits, '-' and '_'",
            what
        )));
    }
    Ok(())
}
