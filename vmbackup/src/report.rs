//! Run summary and process exit status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::types::{Outcome, VmBackupResult};

/// Every guest succeeded or was skipped.
pub const EXIT_SUCCESS: i32 = 0;
/// At least one guest backup is incomplete.
pub const EXIT_PARTIAL_FAILURE: i32 = 1;
/// Configuration could not be loaded or is invalid.
pub const EXIT_CONFIG: i32 = 2;
/// A guest that was running before the backup is down.
pub const EXIT_RESTART_FAILURE: i32 = 3;
/// The hypervisor could not be reached or listed.
pub const EXIT_HYPERVISOR: i32 = 4;

/// Aggregate view of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub restart_failures: usize,
    pub bytes_copied: u64,
    pub results: Vec<VmBackupResult>,
}

impl RunSummary {
    pub fn from_results(results: Vec<VmBackupResult>, started_at: DateTime<Utc>) -> Self {
        let mut summary = Self {
            started_at,
            finished_at: Utc::now(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            restart_failures: 0,
            bytes_copied: 0,
            results: Vec::new(),
        };

        for result in &results {
            match result.outcome {
                Outcome::Success => summary.succeeded += 1,
                Outcome::PartialFailure(_) => summary.failed += 1,
                Outcome::Skipped(_) => summary.skipped += 1,
            }
            if result.restart_failed() {
                summary.restart_failures += 1;
            }
            summary.bytes_copied += result.bytes_copied();
        }

        summary.results = results;
        summary
    }

    /// Process exit status for this run.
    pub fn exit_code(&self) -> i32 {
        if self.restart_failures > 0 {
            EXIT_RESTART_FAILURE
        } else if self.failed > 0 {
            EXIT_PARTIAL_FAILURE
        } else {
            EXIT_SUCCESS
        }
    }

    /// Text for stdout: pretty JSON, or the summary lines.
    ///
    /// Falls back to the summary lines if the JSON cannot be encoded, so the
    /// outcome of a finished run is always printed.
    pub fn render(&self, json: bool) -> String {
        if json {
            match serde_json::to_string_pretty(self) {
                Ok(text) => return format!("{}\n", text),
                Err(e) => error!(error = %e, "Failed to encode results as JSON"),
            }
        }

        let mut text = self.lines().join("\n");
        text.push('\n');
        text
    }

    /// One line per guest plus a totals line.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.results.iter().map(summary_line).collect();
        lines.push(format!(
            "{} guests: {} succeeded, {} failed, {} skipped, {} bytes copied",
            self.results.len(),
            self.succeeded,
            self.failed,
            self.skipped,
            self.bytes_copied
        ));
        lines
    }
}

/// Human-readable status of one guest.
pub fn summary_line(result: &VmBackupResult) -> String {
    match &result.outcome {
        Outcome::Success => {
            let copied = result
                .copies
                .iter()
                .filter(|c| c.bytes_copied > 0)
                .count();
            format!(
                "{}: success ({} of {} volumes copied, restarted: {})",
                result.name,
                copied,
                result.copies.len(),
                yes_no(result.restarted)
            )
        }
        Outcome::PartialFailure(reason) => {
            let details: Vec<String> = result.failures.iter().map(|f| f.to_string()).collect();
            format!(
                "{}: FAILED {} (restarted: {}) [{}]",
                result.name,
                reason,
                yes_no(result.restarted),
                details.join("; ")
            )
        }
        Outcome::Skipped(reason) => format!("{}: skipped ({})", result.name, reason),
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn test_exit_codes() {
        let ok = vec![
            VmBackupResult::from_parts("a", Vec::new(), Vec::new(), None, true, 1),
            VmBackupResult::skipped("b", "excluded"),
        ];
        assert_eq!(RunSummary::from_results(ok, Utc::now()).exit_code(), 0);

        let partial = vec![VmBackupResult::failed("a", FailureKind::Copy, "disk full")];
        assert_eq!(RunSummary::from_results(partial, Utc::now()).exit_code(), 1);

        let restart = vec![
            VmBackupResult::failed("a", FailureKind::Copy, "disk full"),
            VmBackupResult::failed("b", FailureKind::RestartFailed, "start refused"),
        ];
        let summary = RunSummary::from_results(restart, Utc::now());
        assert_eq!(summary.exit_code(), 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.restart_failures, 1);
    }

    #[test]
    fn test_summary_lines() {
        let result = VmBackupResult::failed("db_vm", FailureKind::ShutdownTimeout, "still running");
        let line = summary_line(&result);
        assert!(line.starts_with("db_vm: FAILED shutdown-timeout"));
        assert!(line.contains("still running"));

        let line = summary_line(&VmBackupResult::skipped("test_vm", "excluded"));
        assert_eq!(line, "test_vm: skipped (excluded)");
    }

    #[test]
    fn test_render() {
        let results = vec![
            VmBackupResult::failed("db_vm", FailureKind::RestartFailed, "start refused"),
            VmBackupResult::skipped("test_vm", "excluded"),
        ];
        let summary = RunSummary::from_results(results, Utc::now());

        let json: serde_json::Value = serde_json::from_str(&summary.render(true)).unwrap();
        assert_eq!(json["restart_failures"], 1);
        assert_eq!(json["results"][0]["outcome"]["reason"], "restart-failed");

        let text = summary.render(false);
        assert!(text.starts_with("db_vm: FAILED restart-failed"));
        assert!(text.contains("test_vm: skipped (excluded)"));
        assert!(text.ends_with("2 guests: 0 succeeded, 1 failed, 1 skipped, 0 bytes copied\n"));
    }
}
