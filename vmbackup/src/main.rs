//! # vmbackup
//!
//! Backs up every libvirt guest on this host, one at a time: shut it down,
//! export its definition, copy its disks, start it again.
//!
//! ## Usage
//! ```bash
//! vmbackup --config /etc/vmbackup.toml
//! vmbackup --dev --dry-run --destination /tmp/vm-backup
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vmbackup::cli::Args;
use vmbackup::config::BackupConfig;
use vmbackup::report::{self, RunSummary};
use vmbackup::runner;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("vmbackup: {:#}", e);
            report::EXIT_CONFIG
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let args = Args::parse();

    // Initialize logging
    args.log_format.init(&args.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting vmbackup");

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Configuration rejected");
            return Ok(report::EXIT_CONFIG);
        }
    };

    info!(
        destination = %config.destination.display(),
        timeout_secs = config.timeout_seconds,
        uri = %config.hypervisor.uri,
        dry_run = args.dry_run,
        "vmbackup configured"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let hypervisor = match runner::connect(&config, args.dev).await {
        Ok(hypervisor) => hypervisor,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to connect to hypervisor");
            return Ok(report::EXIT_HYPERVISOR);
        }
    };

    let started_at = Utc::now();
    let results = match runner::execute(hypervisor, &config, &cancel, args.dry_run).await {
        Ok(results) => results,
        Err(e) => {
            error!(error = %e, "Backup run aborted");
            return Ok(report::EXIT_HYPERVISOR);
        }
    };

    let summary = RunSummary::from_results(results, started_at);

    print!("{}", summary.render(args.json));

    let code = summary.exit_code();
    if code == report::EXIT_RESTART_FAILURE {
        error!(
            guests = summary.restart_failures,
            "Some guests were left down; manual intervention required"
        );
    }
    info!(exit_code = code, "vmbackup finished");
    Ok(code)
}

fn load_config(args: &Args) -> Result<BackupConfig> {
    let config = BackupConfig::load(args.config.as_deref())
        .context("failed to load configuration")?
        .with_cli_overrides(args);
    config.validate()?;
    Ok(config)
}

/// Cancel the run on SIGINT or SIGTERM. The guest in flight is still
/// started again before the process exits.
async fn cancel_on_signal(cancel: CancellationToken) {
    if let Err(e) = wait_for_shutdown_signal().await {
        warn!(error = %e, "Cannot listen for signals; run is not cancellable");
        return;
    }
    warn!("Cancelling backup run");
    cancel.cancel();
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or Ctrl+C)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
