//! Configuration for a backup run.
//!
//! Layered as built-in defaults, then the TOML file, then `VMBACKUP_*`
//! environment variables, then CLI overrides. The result is validated once
//! and is immutable for the rest of the run.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmbackup.toml";

/// Default backup destination root.
pub const DEFAULT_DESTINATION: &str = "/tank/VM";

/// Errors raised while loading or validating configuration.
///
/// Any of these aborts the run before a guest is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How the copy planner decides that a destination file is already current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareMode {
    /// Same length and same modification time.
    #[default]
    Metadata,
    /// Same length and same BLAKE3 digest.
    Checksum,
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Root of the backup tree; one subdirectory per guest
    pub destination: PathBuf,
    /// Seconds to wait for a guest to power off
    pub timeout_seconds: u64,
    /// Guests whose storage is not copied (definition only)
    #[serde(deserialize_with = "lowercase_set")]
    skip_storage: BTreeSet<String>,
    /// Guests that are not touched at all
    #[serde(deserialize_with = "lowercase_set")]
    exclude: BTreeSet<String>,
    /// Skip copying images that are already identical at the destination
    pub skip_copy_if_same: bool,
    /// Identity check used by `skip_copy_if_same`
    pub compare: CompareMode,
    /// Interval between power-state polls while waiting for shutdown
    pub poll_interval_ms: u64,
    /// Hypervisor connection
    pub hypervisor: HypervisorConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            destination: PathBuf::from(DEFAULT_DESTINATION),
            timeout_seconds: 120,
            skip_storage: BTreeSet::new(),
            exclude: BTreeSet::new(),
            skip_copy_if_same: true,
            compare: CompareMode::Metadata,
            poll_interval_ms: 1000,
            hypervisor: HypervisorConfig::default(),
        }
    }
}

/// Hypervisor connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Libvirt connection URI
    pub uri: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: vmbackup_hypervisor::libvirt::DEFAULT_URI.to_string(),
        }
    }
}

impl BackupConfig {
    /// Load configuration.
    ///
    /// With `path == None` the default location is tried and silently
    /// skipped when absent. An explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };

        if required && !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(required),
            )
            .add_source(environment())
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Parse configuration from TOML text, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref destination) = args.destination {
            self.destination = destination.clone();
        }

        if let Some(timeout) = args.timeout {
            self.timeout_seconds = timeout;
        }

        if let Some(ref uri) = args.uri {
            self.hypervisor.uri = uri.clone();
        }

        for name in &args.exclude {
            self.exclude.insert(name.to_lowercase());
        }

        self
    }

    /// Check invariants the rest of the run relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "timeout_seconds must be greater than zero".to_string(),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.destination.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("destination is empty".to_string()));
        }

        if !self.destination.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "destination must be an absolute path: {}",
                self.destination.display()
            )));
        }

        Ok(())
    }

    /// Add guests that must not be touched.
    pub fn with_exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.exclude
            .extend(names.into_iter().map(|n| n.as_ref().to_lowercase()));
        self
    }

    /// Add guests whose storage is not copied.
    pub fn with_skip_storage<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.skip_storage
            .extend(names.into_iter().map(|n| n.as_ref().to_lowercase()));
        self
    }

    /// Whether a guest is excluded from the run (case-insensitive).
    pub fn is_excluded(&self, guest_name: &str) -> bool {
        self.exclude.contains(&guest_name.to_lowercase())
    }

    /// Whether a guest's storage copy is skipped (case-insensitive).
    pub fn skips_storage(&self, guest_name: &str) -> bool {
        self.skip_storage.contains(&guest_name.to_lowercase())
    }

    /// Excluded guest names, lower-cased.
    pub fn excluded(&self) -> &BTreeSet<String> {
        &self.exclude
    }

    /// Directory that holds one guest's backup.
    pub fn guest_dir(&self, guest_name: &str) -> PathBuf {
        self.destination.join(guest_name)
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

/// `VMBACKUP_*` overrides; `__` separates nested keys
/// (`VMBACKUP_HYPERVISOR__URI`), lists are comma separated.
fn environment() -> config::Environment {
    config::Environment::with_prefix("VMBACKUP")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("exclude")
        .with_list_parse_key("skip_storage")
}

fn lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let names = Vec::<String>::deserialize(deserializer)?;
    Ok(names.into_iter().map(|n| n.to_lowercase()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackupConfig::default();
        assert_eq!(config.destination, PathBuf::from("/tank/VM"));
        assert_eq!(config.timeout_seconds, 120);
        assert!(config.skip_copy_if_same);
        assert_eq!(config.compare, CompareMode::Metadata);
        assert_eq!(config.hypervisor.uri, "qemu:///system");
        assert!(config.excluded().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml = r#"
destination = "/srv/backup/vm"
timeout_seconds = 300
exclude = ["Test_VM"]
skip_storage = ["simple_vm"]
skip_copy_if_same = false
compare = "checksum"

[hypervisor]
uri = "qemu+ssh://root@host/system"
"#;

        let config = BackupConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.destination, PathBuf::from("/srv/backup/vm"));
        assert_eq!(config.timeout_seconds, 300);
        assert!(!config.skip_copy_if_same);
        assert_eq!(config.compare, CompareMode::Checksum);
        assert_eq!(config.hypervisor.uri, "qemu+ssh://root@host/system");
        // Unset keys keep their defaults
        assert_eq!(config.poll_interval_ms, 1000);

        assert!(config.is_excluded("test_vm"));
        assert!(config.is_excluded("TEST_VM"));
        assert!(config.skips_storage("Simple_VM"));
        assert!(!config.skips_storage("db_vm"));
    }

    #[test]
    fn test_validation() {
        let mut config = BackupConfig::default();
        config.timeout_seconds = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = BackupConfig::default();
        config.destination = PathBuf::from("relative/dir");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = BackupConfig::default();
        config.poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_toml() {
        let result = BackupConfig::from_toml_str("timeout_seconds = \"soon\"");
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_explicit_missing_file() {
        let result = BackupConfig::load(Some(Path::new("/nonexistent/vmbackup.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmbackup.toml");
        std::fs::write(&path, "timeout_seconds = 30\nexclude = [\"scratch\"]\n").unwrap();

        let config = BackupConfig::load(Some(&path)).unwrap();
        assert_eq!(config.timeout_seconds, 30);
        assert!(config.is_excluded("Scratch"));
    }
}
