//! Command-line argument parsing.

use clap::Parser;
use std::path::PathBuf;
use vmbackup_common::LogFormat;

/// vmbackup - Back up libvirt guests to a local backup tree
#[derive(Parser, Debug, Default)]
#[command(name = "vmbackup")]
#[command(about = "Shut down guests, copy their disks and definitions, start them again")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (defaults to /etc/vmbackup.toml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "VMBACKUP_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty", env = "VMBACKUP_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Override the backup destination root
    #[arg(short, long)]
    pub destination: Option<PathBuf>,

    /// Override the shutdown timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Libvirt connection URI (e.g., qemu:///system)
    #[arg(long)]
    pub uri: Option<String>,

    /// Exclude an additional guest (repeatable)
    #[arg(short, long = "exclude", value_name = "GUEST")]
    pub exclude: Vec<String>,

    /// Use the in-memory mock hypervisor instead of libvirt
    #[arg(long)]
    pub dev: bool,

    /// Report what would be done without touching guests or files
    #[arg(long)]
    pub dry_run: bool,

    /// Print the run results as JSON instead of summary lines
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let args = Args::parse_from([
            "vmbackup",
            "--config",
            "/etc/custom.toml",
            "--timeout",
            "5",
            "-e",
            "scratch",
            "--exclude",
            "build",
            "--dry-run",
        ]);

        assert_eq!(args.config, Some(PathBuf::from("/etc/custom.toml")));
        assert_eq!(args.timeout, Some(5));
        assert_eq!(args.exclude, vec!["scratch", "build"]);
        assert!(args.dry_run);
        assert!(!args.dev);
        assert_eq!(args.log_level, "info");
        assert_eq!(args.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_log_format() {
        let args = Args::parse_from(["vmbackup", "--log-format", "json"]);
        assert_eq!(args.log_format, LogFormat::Json);

        assert!(Args::try_parse_from(["vmbackup", "--log-format", "xml"]).is_err());
    }
}
