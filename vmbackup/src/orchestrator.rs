//! Per-guest backup lifecycle.
//!
//! For one guest the orchestrator runs, in order:
//!
//! 1. exclusion check (no side effects when excluded)
//! 2. destination directory creation
//! 3. power state capture
//! 4. graceful shutdown, bounded by the configured timeout
//! 5. definition export
//! 6. storage copy, only if the guest is really off
//! 7. restart, if the guest was running in step 3
//! 8. result aggregation
//!
//! Steps 4-6 run inside [`Orchestrator::quiesce_and_copy`], which can only
//! record failures, never return early out of `backup_guest`. Step 7 runs
//! after that future completes, whether it finished normally, observed a
//! cancellation or panicked. A guest that was up before the backup always
//! gets exactly one start request.

use futures::FutureExt;
use std::collections::HashSet;
use std::ffi::OsString;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vmbackup_hypervisor::{GuestState, Hypervisor, HypervisorError};

use crate::config::BackupConfig;
use crate::copy::{self, CopyAction, CopyDecision, CopyError};
use crate::error::{FailureKind, StepFailure};
use crate::types::{GuestHandle, VmBackupResult, SKIP_EXCLUDED};

/// How waiting for a guest to power off ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownWait {
    Stopped,
    TimedOut,
    Cancelled,
}

/// Failures and artifacts collected while one guest is processed.
#[derive(Default)]
struct GuestRun {
    failures: Vec<StepFailure>,
    copies: Vec<CopyDecision>,
    definition: Option<PathBuf>,
    restarted: bool,
}

impl GuestRun {
    fn fail(&mut self, kind: FailureKind, detail: impl Into<String>) {
        self.failures.push(StepFailure::new(kind, detail));
    }

    fn fail_volume(&mut self, kind: FailureKind, volume: &Path, detail: impl Into<String>) {
        self.failures
            .push(StepFailure::for_volume(kind, volume, detail));
    }

    fn finish(self, name: &str, started: Instant) -> VmBackupResult {
        VmBackupResult::from_parts(
            name,
            self.copies,
            self.failures,
            self.definition,
            self.restarted,
            started.elapsed().as_millis() as u64,
        )
    }
}

/// Drives the backup of one guest at a time.
pub struct Orchestrator<'a> {
    hypervisor: &'a dyn Hypervisor,
    config: &'a BackupConfig,
    cancel: CancellationToken,
    dry_run: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        hypervisor: &'a dyn Hypervisor,
        config: &'a BackupConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hypervisor,
            config,
            cancel,
            dry_run: false,
        }
    }

    /// Plan only: no power changes, no files written.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Back up one guest. Never fails; every problem ends up in the result.
    #[instrument(skip_all, fields(guest = %guest.name))]
    pub async fn backup_guest(&self, guest: &GuestHandle) -> VmBackupResult {
        let started = Instant::now();

        if self.config.is_excluded(&guest.name) {
            info!("Guest is excluded, skipping");
            return VmBackupResult::skipped(&guest.name, SKIP_EXCLUDED);
        }

        let mut run = GuestRun::default();

        let dir = match self.prepare_destination(&guest.name).await {
            Ok(dir) => dir,
            Err(detail) => {
                error!(error = %detail, "Cannot prepare destination, guest left untouched");
                run.fail(FailureKind::Mkdir, detail);
                return run.finish(&guest.name, started);
            }
        };

        let was_running = guest.was_running;
        debug!(was_running, "Captured guest state");

        let steps = AssertUnwindSafe(self.quiesce_and_copy(guest, &dir, was_running, &mut run))
            .catch_unwind()
            .await;
        if steps.is_err() {
            error!("Backup steps panicked");
            run.fail(FailureKind::Internal, "backup steps panicked");
        }

        if was_running {
            run.restarted = self.restart(guest, &mut run).await;
        }

        let result = run.finish(&guest.name, started);
        if result.restart_failed() {
            error!(
                guest = %guest.name,
                "Guest was running before the backup and is DOWN now; manual intervention required"
            );
        }
        result
    }

    /// Create `<destination>/<guest name>`.
    async fn prepare_destination(&self, name: &str) -> Result<PathBuf, String> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(format!("guest name '{}' is not usable as a directory name", name));
        }

        let dir = self.config.guest_dir(name);

        if self.dry_run {
            debug!(dir = %dir.display(), "Dry run: not creating destination");
            return Ok(dir);
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("failed to create {}: {}", dir.display(), e))?;

        Ok(dir)
    }

    /// Steps 4-6. Records failures on `run` and returns normally.
    async fn quiesce_and_copy(
        &self,
        guest: &GuestHandle,
        dir: &Path,
        was_running: bool,
        run: &mut GuestRun,
    ) {
        let quiesced = if was_running {
            self.shutdown(guest, run).await
        } else {
            true
        };

        self.export_definition(guest, dir, run).await;

        if !quiesced {
            warn!("Guest did not power off, not copying storage");
            return;
        }

        if self.config.skips_storage(&guest.name) {
            info!("Storage copy disabled for this guest");
            return;
        }

        self.copy_volumes(guest, dir, run).await;
    }

    /// Request shutdown and wait for it. Returns whether the guest is off.
    async fn shutdown(&self, guest: &GuestHandle, run: &mut GuestRun) -> bool {
        if self.dry_run {
            info!("Dry run: would shut down guest");
            return true;
        }

        info!(timeout_secs = self.config.timeout_seconds, "Shutting down active guest");

        if let Err(e) = self.hypervisor.request_shutdown(&guest.id).await {
            error!(error = %e, "Shutdown request failed");
            run.fail(FailureKind::Hypervisor, format!("shutdown request failed: {}", e));
            return false;
        }

        match self.wait_for_shutdown(&guest.id).await {
            Ok(ShutdownWait::Stopped) => {
                info!("Guest shut down, backing up");
                true
            }
            Ok(ShutdownWait::TimedOut) => {
                error!(
                    timeout_secs = self.config.timeout_seconds,
                    "Could not shut down guest"
                );
                run.fail(
                    FailureKind::ShutdownTimeout,
                    format!(
                        "guest still running after {}s",
                        self.config.timeout_seconds
                    ),
                );
                false
            }
            Ok(ShutdownWait::Cancelled) => {
                warn!("Cancelled while waiting for shutdown");
                run.fail(FailureKind::Cancelled, "cancelled while waiting for shutdown");
                false
            }
            Err(e) => {
                error!(error = %e, "Lost track of guest state during shutdown");
                run.fail(FailureKind::Hypervisor, format!("state query failed: {}", e));
                false
            }
        }
    }

    /// Poll the power state until the guest is off, the timeout expires or
    /// the run is cancelled. The state is checked once more at the deadline.
    async fn wait_for_shutdown(&self, guest_id: &str) -> Result<ShutdownWait, HypervisorError> {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        let interval = self.config.poll_interval();

        loop {
            if !self.hypervisor.is_running(guest_id).await? {
                return Ok(ShutdownWait::Stopped);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(ShutdownWait::TimedOut);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(ShutdownWait::Cancelled),
                _ = tokio::time::sleep(interval.min(deadline - now)) => {}
            }
        }
    }

    /// Step 5: export the definition and write `<guest name>.xml` next to
    /// the images.
    async fn export_definition(&self, guest: &GuestHandle, dir: &Path, run: &mut GuestRun) {
        let path = dir.join(definition_file_name(&guest.name));

        let xml = match self.hypervisor.export_definition(&guest.id).await {
            Ok(xml) => xml,
            Err(e) => {
                error!(error = %e, "Failed to export definition");
                run.fail(FailureKind::Export, format!("definition export failed: {}", e));
                return;
            }
        };

        if self.dry_run {
            info!(path = %path.display(), "Dry run: would write definition");
            return;
        }

        let target = path.clone();
        let written =
            tokio::task::spawn_blocking(move || copy::write_file_atomic(&target, xml.as_bytes()))
                .await;

        match written {
            Ok(Ok(())) => {
                info!(path = %path.display(), "Backed up XML description");
                run.definition = Some(path);
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to write definition");
                run.fail(FailureKind::Export, e.to_string());
            }
            Err(e) => {
                error!(error = %e, "Definition writer did not complete");
                run.fail(FailureKind::Export, e.to_string());
            }
        }
    }

    /// Step 6: plan and copy every volume; one failure does not stop the rest.
    async fn copy_volumes(&self, guest: &GuestHandle, dir: &Path, run: &mut GuestRun) {
        let volumes = match self.hypervisor.list_storage_volumes(&guest.id).await {
            Ok(volumes) => volumes,
            Err(e) => {
                error!(error = %e, "Failed to list storage volumes");
                run.fail(FailureKind::Hypervisor, format!("volume listing failed: {}", e));
                return;
            }
        };
        debug!(volumes = volumes.len(), "Listed storage volumes");

        // The definition shares the directory with the images
        let mut names = HashSet::new();
        names.insert(OsString::from(definition_file_name(&guest.name)));

        for volume in &volumes {
            if self.cancel.is_cancelled() {
                warn!("Cancelled, not copying remaining volumes");
                run.fail(FailureKind::Cancelled, "cancelled before all volumes were copied");
                return;
            }

            let Some(file_name) = volume.file_name() else {
                run.fail_volume(FailureKind::Copy, volume, "volume path has no file name");
                continue;
            };

            if !names.insert(file_name.to_os_string()) {
                error!(volume = %volume.display(), "Another volume already uses this file name");
                run.fail_volume(
                    FailureKind::Copy,
                    volume,
                    "volume-name-collision: another file of this guest's backup has the same name",
                );
                continue;
            }

            let dest = dir.join(file_name);
            info!(volume = %volume.display(), dest = %dest.display(), "Backing up volume");

            match self.copy_volume(volume, &dest).await {
                Ok(decision) => run.copies.push(decision),
                Err(CopyError::Cancelled) => {
                    warn!(volume = %volume.display(), "Copy cancelled");
                    run.fail_volume(FailureKind::Cancelled, volume, "copy cancelled");
                    return;
                }
                Err(e) => {
                    error!(volume = %volume.display(), error = %e, "Volume copy failed");
                    run.fail_volume(FailureKind::Copy, volume, e.to_string());
                }
            }
        }
    }

    /// Wait while the guest is `ShuttingDown`, at most the shutdown timeout.
    /// Cancellation is ignored: the restart must still happen.
    async fn settle_shutdown(&self, guest_id: &str) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        let interval = self.config.poll_interval();

        loop {
            match self.hypervisor.get_guest_state(guest_id).await {
                Ok(GuestState::ShuttingDown) => {}
                Ok(_) => return,
                Err(e) => {
                    debug!(error = %e, "State unknown before restart");
                    return;
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!("Guest is still shutting down, starting anyway");
                return;
            }
            debug!("Waiting for shutdown to finish before restart");
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Run the planner on the blocking pool.
    async fn copy_volume(&self, source: &Path, dest: &Path) -> Result<CopyDecision, CopyError> {
        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        let skip_if_same = self.config.skip_copy_if_same;
        let compare = self.config.compare;
        let cancel = self.cancel.clone();
        let dry_run = self.dry_run;
        let failed_path = dest.clone();

        tokio::task::spawn_blocking(move || {
            if dry_run {
                let action = copy::plan(&source, &dest, skip_if_same, compare)?;
                if action == CopyAction::Copy {
                    info!(volume = %source.display(), "Dry run: would copy volume");
                }
                return Ok(CopyDecision {
                    source,
                    dest,
                    action,
                    bytes_copied: 0,
                });
            }
            copy::plan_and_copy(&source, &dest, skip_if_same, compare, &cancel)
        })
        .await
        .map_err(|e| CopyError::Io {
            path: failed_path,
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?
    }

    /// Step 7: one start request. Returns whether the guest is up afterwards.
    ///
    /// A guest still shutting down (after a timeout) cannot be started, so
    /// its shutdown is waited out first, bounded by the shutdown timeout.
    async fn restart(&self, guest: &GuestHandle, run: &mut GuestRun) -> bool {
        if self.dry_run {
            info!("Dry run: would start guest");
            return false;
        }

        self.settle_shutdown(&guest.id).await;

        info!("Starting guest");

        match self.hypervisor.start_guest(&guest.id).await {
            Ok(()) => {
                info!("Guest started");
                true
            }
            Err(start_err) => match self.hypervisor.get_guest_state(&guest.id).await {
                // Never went down (shutdown timed out or was refused)
                Ok(state) if state.is_up() => {
                    info!(error = %start_err, state = %state, "Guest is already up");
                    true
                }
                Ok(state) => {
                    run.fail(
                        FailureKind::RestartFailed,
                        format!("{} (guest is {})", start_err, state),
                    );
                    false
                }
                Err(query_err) => {
                    run.fail(
                        FailureKind::RestartFailed,
                        format!("{} (state unknown: {})", start_err, query_err),
                    );
                    false
                }
            },
        }
    }
}

fn definition_file_name(guest_name: &str) -> String {
    format!("{}.xml", guest_name)
}
