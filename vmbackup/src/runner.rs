//! Run controller.
//!
//! Opens the hypervisor connection, walks every guest in listing order
//! through the orchestrator and closes the connection again, whatever
//! happened in between.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vmbackup_hypervisor::{Hypervisor, HypervisorError, MockBackend, MockGuestSpec};

use crate::config::BackupConfig;
use crate::error::FailureKind;
use crate::orchestrator::Orchestrator;
use crate::types::{GuestHandle, Outcome, VmBackupResult, SKIP_CANCELLED, SKIP_EXCLUDED};

/// Open the hypervisor connection the run will use.
///
/// `dev` selects the in-memory mock backend, seeded with a few demo guests.
pub async fn connect(config: &BackupConfig, dev: bool) -> anyhow::Result<Box<dyn Hypervisor>> {
    let hypervisor = open(config, dev).await?;

    match hypervisor.health_check().await {
        Ok(true) => info!("Hypervisor connection healthy"),
        Ok(false) => warn!("Hypervisor connection reports unhealthy"),
        Err(e) => warn!(error = %e, "Hypervisor health check failed"),
    }

    Ok(hypervisor)
}

async fn open(config: &BackupConfig, dev: bool) -> anyhow::Result<Box<dyn Hypervisor>> {
    if dev {
        info!("Using mock hypervisor backend");
        return Ok(Box::new(dev_backend()));
    }

    #[cfg(feature = "libvirt")]
    {
        let uri = config.hypervisor.uri.as_str();
        info!(uri = %uri, "Using libvirt hypervisor backend");
        let backend = vmbackup_hypervisor::LibvirtBackend::connect(uri).await?;
        Ok(Box::new(backend))
    }

    #[cfg(not(feature = "libvirt"))]
    {
        anyhow::bail!(
            "libvirt backend requested for {} but not compiled in; rebuild with --features libvirt or use --dev",
            config.hypervisor.uri
        )
    }
}

/// Mock backend for `--dev` runs. The guests have no disks.
fn dev_backend() -> MockBackend {
    let backend = MockBackend::new();
    backend.add_guest(MockGuestSpec::new("test_vm").running());
    backend.add_guest(MockGuestSpec::new("simple_vm").running());
    backend.add_guest(MockGuestSpec::new("db_vm"));
    backend
}

/// Run the backup over `hypervisor` and release it afterwards.
///
/// The connection is closed on every path, including a failed listing.
pub async fn execute(
    hypervisor: Box<dyn Hypervisor>,
    config: &BackupConfig,
    cancel: &CancellationToken,
    dry_run: bool,
) -> Result<Vec<VmBackupResult>, HypervisorError> {
    let results = run_backup(hypervisor.as_ref(), config, cancel, dry_run).await;

    if let Err(e) = hypervisor.close().await {
        warn!(error = %e, "Failed to close hypervisor connection");
    }

    results
}

/// Back up every guest, one at a time.
///
/// Only a failed listing is an error; everything that goes wrong for a
/// single guest is reported in that guest's result.
pub async fn run_backup(
    hypervisor: &dyn Hypervisor,
    config: &BackupConfig,
    cancel: &CancellationToken,
    dry_run: bool,
) -> Result<Vec<VmBackupResult>, HypervisorError> {
    let guests = hypervisor.list_guests().await.map_err(|e| {
        error!(error = %e, "Failed to list guests");
        e
    })?;

    info!(
        guests = guests.len(),
        excluded = ?config.excluded(),
        dry_run,
        "Starting backup run"
    );

    let orchestrator =
        Orchestrator::new(hypervisor, config, cancel.clone()).with_dry_run(dry_run);
    let mut results = Vec::with_capacity(guests.len());

    for info in &guests {
        if config.is_excluded(&info.name) {
            info!(guest = %info.name, "Guest is excluded, skipping");
            results.push(VmBackupResult::skipped(&info.name, SKIP_EXCLUDED));
            continue;
        }

        if cancel.is_cancelled() {
            info!(guest = %info.name, "Run cancelled, not starting guest");
            results.push(VmBackupResult::skipped(&info.name, SKIP_CANCELLED));
            continue;
        }

        let handle = match GuestHandle::resolve(hypervisor, info).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(guest = %info.name, error = %e, "Failed to inspect guest");
                results.push(VmBackupResult::failed(
                    &info.name,
                    FailureKind::Hypervisor,
                    e.to_string(),
                ));
                continue;
            }
        };

        let result = orchestrator.backup_guest(&handle).await;
        match &result.outcome {
            Outcome::Success => info!(
                guest = %result.name,
                bytes = result.bytes_copied(),
                duration_ms = result.duration_ms,
                "Guest backed up"
            ),
            Outcome::PartialFailure(reason) => warn!(
                guest = %result.name,
                reason = %reason,
                failures = result.failures.len(),
                "Guest backup incomplete"
            ),
            Outcome::Skipped(reason) => info!(guest = %result.name, reason = %reason, "Guest skipped"),
        }
        results.push(result);
    }

    Ok(results)
}
